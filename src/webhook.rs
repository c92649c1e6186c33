use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

use crate::dispatcher::{Ack, Dispatcher};
use crate::update::Update;

pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct WebhookOptions {
    pub path: String,
    pub secret_token: Option<String>,
    pub max_body_bytes: usize,
    /// Serve HTTPS directly instead of plain HTTP.
    pub tls: Option<TlsOptions>,
}

/// PEM files for the certificate chain and its private key.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsOptions {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// A request body that upstream middleware already parsed as JSON. When this
/// extension is present the raw body is not read.
#[derive(Debug, Clone)]
pub struct PreparsedBody(pub Value);

/// Compares request path and secret header against the configured values
/// without leaking, through timing, where they differ or how long they are.
///
/// Both sides are MACed under a per-process random key and the tags are
/// compared with `verify_slice`, which runs in constant time.
struct Authenticator {
    key: [u8; 16],
    path_tag: Vec<u8>,
    secret_tag: Option<Vec<u8>>,
}

impl Authenticator {
    fn new(path: &str, secret_token: Option<&str>) -> Self {
        let key = *uuid::Uuid::new_v4().as_bytes();
        Self {
            path_tag: tag(&key, path.as_bytes()),
            secret_tag: secret_token.map(|secret| tag(&key, secret.as_bytes())),
            key,
        }
    }

    fn matches(&self, expected_tag: &[u8], observed: &[u8]) -> bool {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(observed);
        mac.verify_slice(expected_tag).is_ok()
    }

    fn authorize(&self, path: &str, secret: Option<&[u8]>) -> bool {
        // Evaluate both checks so a path mismatch costs the same as a secret
        // mismatch.
        let path_ok = self.matches(&self.path_tag, path.as_bytes());
        let secret_ok = match &self.secret_tag {
            None => true,
            Some(expected) => self.matches(expected, secret.unwrap_or_default()),
        };
        path_ok & secret_ok
    }
}

fn tag(key: &[u8], value: &[u8]) -> Vec<u8> {
    match HmacSha256::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(value);
            mac.finalize().into_bytes().to_vec()
        }
        // HMAC takes keys of any length; an empty tag never verifies.
        Err(_) => Vec::new(),
    }
}

#[derive(Clone)]
struct WebhookState {
    dispatcher: Dispatcher,
    auth: Arc<Authenticator>,
    max_body_bytes: usize,
}

/// Build the webhook router. Every path and method reaches the handler so
/// that a wrong path is answered with 403 rather than 404.
pub fn router(dispatcher: Dispatcher, options: &WebhookOptions) -> Router {
    let state = WebhookState {
        dispatcher,
        auth: Arc::new(Authenticator::new(
            &options.path,
            options.secret_token.as_deref(),
        )),
        max_body_bytes: options.max_body_bytes,
    };
    Router::new().fallback(handle_update).with_state(state)
}

async fn handle_update(State(state): State<WebhookState>, request: Request) -> StatusCode {
    let (parts, body) = request.into_parts();

    let secret = parts.headers.get(SECRET_HEADER).map(|v| v.as_bytes());
    if !state.auth.authorize(parts.uri.path(), secret) {
        warn!("Rejected webhook call to {}", parts.uri.path());
        return StatusCode::FORBIDDEN;
    }

    let update = match parts.extensions.get::<PreparsedBody>() {
        Some(PreparsedBody(value)) => Update::from_value(value.clone()).map_err(Into::into),
        None => read_update(body, state.max_body_bytes).await,
    };
    let update = match update {
        Ok(update) => update,
        Err(e) => {
            warn!("Rejected webhook body: {:#}", e);
            return StatusCode::UNSUPPORTED_MEDIA_TYPE;
        }
    };
    debug!(update_id = update.update_id, "Webhook update received");

    // Dispatch on its own task so a client hanging up cannot cancel it
    // halfway through the subscribers.
    let (ack, done) = Ack::channel();
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        dispatcher.dispatch(vec![update], Some(ack)).await;
    });

    match done.await {
        Ok(()) => StatusCode::OK,
        Err(_) => {
            error!("Webhook dispatch ended without completing");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn read_update(body: Body, limit: usize) -> Result<Update> {
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .context("Failed to read request body")?;
    let text = std::str::from_utf8(&bytes).context("Request body is not UTF-8")?;
    let value: Value = serde_json::from_str(text).context("Request body is not JSON")?;
    Ok(Update::from_value(value)?)
}

pub async fn load_tls(options: &TlsOptions) -> Result<RustlsConfig> {
    RustlsConfig::from_pem_file(&options.cert_path, &options.key_path)
        .await
        .with_context(|| {
            format!(
                "Failed to load TLS certificate {} with key {}",
                options.cert_path.display(),
                options.key_path.display()
            )
        })
}

/// Serve `app` on `listener` until `shutdown` resolves, over HTTPS when
/// `tls` is given. In-flight requests are drained before returning.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    tls: Option<RustlsConfig>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let Some(tls) = tls else {
        return axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("Webhook server error");
    };

    let listener = listener
        .into_std()
        .context("Failed to hand listener to the TLS server")?;
    let handle = axum_server::Handle::new();
    let stopper = handle.clone();
    let watcher = tokio::spawn(async move {
        shutdown.await;
        stopper.graceful_shutdown(None);
    });

    let result = axum_server::from_tcp_rustls(listener, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("Webhook server error");
    watcher.abort();
    result
}
