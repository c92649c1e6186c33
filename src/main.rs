mod api;
mod bot;
mod config;
mod dispatcher;
mod polling;
mod registry;
mod scheduler;
mod taxonomy;
mod update;
mod webhook;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::Bot;
use crate::config::Config;
use crate::taxonomy::EventKind;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,updraft=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Mode: {}", config.telegram.mode);
    info!("  API base: {}", config.telegram.api_base);
    if let Some(cron) = &config.scheduler.tick_cron {
        info!("  Tick: {}", cron);
    }

    let bot = Bot::new(config);
    register_log_subscribers(&bot);

    bot.launch(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await?;

    info!("Bot stopped");
    Ok(())
}

/// Log every event kind the engine produces, so a fresh deployment shows
/// traffic before any real handlers exist.
fn register_log_subscribers(bot: &Bot) {
    bot.on(EventKind::Ready, |ctx| async move {
        let name = ctx.bot.as_ref().and_then(|me| me.username.clone());
        info!("Ready as @{}", name.unwrap_or_default());
        Ok(())
    });

    for kind in taxonomy::ALL_KINDS {
        if matches!(kind, EventKind::Ready | EventKind::Update) {
            continue;
        }
        bot.on(kind, move |ctx| async move {
            let at = ctx.emitted_at.format("%H:%M:%S%.3f");
            match ctx.update_id() {
                Some(id) => info!(emitted_at = %at, "{} (update {})", kind, id),
                None => info!(emitted_at = %at, "{}", kind),
            }
            Ok(())
        });
    }
}
