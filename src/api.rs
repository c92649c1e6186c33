use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::update::Update;

/// Headroom on top of the long-poll timeout before the HTTP request itself
/// is abandoned.
const LONG_POLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request to {method} failed: {source}")]
    Transport {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} returned HTTP {status}")]
    Status {
        method: &'static str,
        status: StatusCode,
    },

    #[error("{method} failed ({code}): {description}")]
    Api {
        method: &'static str,
        code: i64,
        description: String,
        retry_after: Option<u64>,
    },

    #[error("failed to decode {method} response: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    /// Errors that retrying cannot fix: a revoked or wrong token (401/404),
    /// or another consumer holding the update stream (409).
    pub fn is_fatal(&self) -> bool {
        let code = match self {
            ApiError::Api { code, .. } => *code,
            ApiError::Status { status, .. } => i64::from(status.as_u16()),
            _ => return false,
        };
        matches!(code, 401 | 404 | 409)
    }

    /// Seconds the server asked us to wait before the next call.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Api {
                retry_after: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// The bot's own account, as returned by `getMe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Parameters of one `getUpdates` call besides the offset.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub limit: u32,
    /// Long-poll timeout in seconds.
    pub timeout: u64,
    /// Empty means "whatever the server currently delivers".
    pub allowed_updates: Vec<String>,
}

/// Where the polling driver gets its batches from.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn fetch_updates(
        &self,
        offset: i64,
        options: &FetchOptions,
    ) -> Result<Vec<Update>, ApiError>;
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest<'a> {
    offset: i64,
    limit: u32,
    timeout: u64,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    allowed_updates: &'a [String],
}

#[derive(Debug, Serialize)]
pub struct SetWebhookRequest<'a> {
    pub url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_token: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub allowed_updates: &'a [String],
    pub drop_pending_updates: bool,
}

#[derive(Debug, Serialize)]
struct DeleteWebhookRequest {
    drop_pending_updates: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Minimal Bot API client: just the calls the update engine needs.
#[derive(Clone)]
pub struct BotApi {
    client: reqwest::Client,
    base_url: String,
}

impl BotApi {
    pub fn new(token: &str, api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        }
    }

    pub async fn get_me(&self) -> Result<User, ApiError> {
        self.call("getMe", &serde_json::json!({}), None).await
    }

    pub async fn set_webhook(&self, request: &SetWebhookRequest<'_>) -> Result<bool, ApiError> {
        self.call("setWebhook", request, None).await
    }

    pub async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<bool, ApiError> {
        self.call(
            "deleteWebhook",
            &DeleteWebhookRequest {
                drop_pending_updates,
            },
            None,
        )
        .await
    }

    async fn call<B, T>(
        &self,
        method: &'static str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        // The URL embeds the token, so only the method name is logged.
        debug!("Calling Bot API method {}", method);

        let mut request = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|source| ApiError::Transport { method, source })?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|source| ApiError::Transport { method, source })?;

        let parsed: ApiResponse = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => return Err(ApiError::Status { method, status }),
            Err(source) => return Err(ApiError::Decode { method, source }),
        };

        if !parsed.ok {
            return Err(ApiError::Api {
                method,
                code: parsed
                    .error_code
                    .unwrap_or_else(|| i64::from(status.as_u16())),
                description: parsed.description.unwrap_or_default(),
                retry_after: parsed.parameters.and_then(|p| p.retry_after),
            });
        }

        serde_json::from_value(parsed.result.unwrap_or(Value::Null))
            .map_err(|source| ApiError::Decode { method, source })
    }
}

#[async_trait]
impl UpdateSource for BotApi {
    async fn fetch_updates(
        &self,
        offset: i64,
        options: &FetchOptions,
    ) -> Result<Vec<Update>, ApiError> {
        let request = GetUpdatesRequest {
            offset,
            limit: options.limit,
            timeout: options.timeout,
            allowed_updates: &options.allowed_updates,
        };
        self.call(
            "getUpdates",
            &request,
            Some(Duration::from_secs(options.timeout) + LONG_POLL_GRACE),
        )
        .await
    }
}
