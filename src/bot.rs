use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::api::{BotApi, SetWebhookRequest};
use crate::config::{Config, LaunchMode};
use crate::dispatcher::Dispatcher;
use crate::polling::Poller;
use crate::registry::{Context as EventContext, HandlerResult, SubscriberRegistry, SubscriptionId};
use crate::scheduler::Scheduler;
use crate::taxonomy::EventKind;
use crate::webhook;

/// Wires the registry, the dispatcher and exactly one transport together.
pub struct Bot {
    config: Config,
    api: BotApi,
    dispatcher: Dispatcher,
}

impl Bot {
    pub fn new(config: Config) -> Self {
        let api = BotApi::new(&config.telegram.bot_token, &config.telegram.api_base);
        let dispatcher = Dispatcher::new(Arc::new(SubscriberRegistry::new()));
        Self {
            config,
            api,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        self.dispatcher.registry()
    }

    pub fn on<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<EventContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry().subscribe(kind, handler)
    }

    /// Run the configured transport until `shutdown` resolves or the
    /// transport fails. `ready` is emitted once updates can arrive and
    /// `stopped` once they no longer can, whichever way the run ends.
    pub async fn launch<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let me = self
            .api
            .get_me()
            .await
            .context("Failed to fetch bot identity")?;
        info!(
            "Authorized as @{} (id {})",
            me.username.as_deref().unwrap_or(&me.first_name),
            me.id
        );
        self.dispatcher.set_bot_info(me);

        let mut scheduler = self.start_scheduler().await?;

        info!("Launching in {} mode", self.config.telegram.mode);
        let result = match self.config.telegram.mode {
            LaunchMode::Polling => self.run_polling(shutdown).await,
            LaunchMode::Webhook => self.run_webhook(shutdown).await,
        };

        if let Some(scheduler) = scheduler.as_mut() {
            if let Err(e) = scheduler.shutdown().await {
                warn!("{:#}", e);
            }
        }
        self.dispatcher.emit(EventKind::Stopped).await;
        result
    }

    async fn start_scheduler(&self) -> Result<Option<Scheduler>> {
        let Some(cron) = self.config.scheduler.tick_cron.as_deref() else {
            return Ok(None);
        };
        let scheduler = Scheduler::new().await?;
        scheduler.add_tick(cron, self.dispatcher.clone()).await?;
        scheduler.start().await?;
        Ok(Some(scheduler))
    }

    async fn run_polling<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // getUpdates answers 409 while a webhook is registered.
        self.api
            .delete_webhook(self.config.telegram.drop_pending_updates)
            .await
            .context("Failed to remove webhook before polling")?;

        let mut poller = Poller::new(
            Arc::new(self.api.clone()),
            self.dispatcher.clone(),
            self.config.polling.options(),
        );
        let stop = poller.stop_handle();
        let watcher = tokio::spawn(async move {
            shutdown.await;
            info!("Shutdown requested, stopping after the current fetch");
            stop.close();
        });

        self.dispatcher.emit(EventKind::Ready).await;
        let result = poller.start().await.context("Polling failed");
        watcher.abort();
        result
    }

    async fn run_webhook<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let settings = &self.config.webhook;
        let url = settings
            .public_url()
            .context("webhook.domain is required in webhook mode")?;
        let options = settings.options();
        let tls = match &options.tls {
            Some(tls) => Some(webhook::load_tls(tls).await?),
            None => None,
        };

        self.api
            .set_webhook(&SetWebhookRequest {
                url: &url,
                secret_token: options.secret_token.as_deref(),
                allowed_updates: &settings.allowed_updates,
                drop_pending_updates: self.config.telegram.drop_pending_updates,
            })
            .await
            .context("Failed to register webhook")?;

        let addr = settings.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind webhook listener on {}", addr))?;
        info!(
            "Webhook for {} listening on {} ({})",
            url,
            addr,
            if tls.is_some() { "https" } else { "http" }
        );

        let app = webhook::router(self.dispatcher.clone(), &options);
        self.dispatcher.emit(EventKind::Ready).await;
        webhook::serve(listener, app, tls, shutdown).await
    }
}
