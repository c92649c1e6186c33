use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::taxonomy::EventKind;

/// Wrapper around tokio-cron-scheduler for timer events
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    /// Create a new scheduler
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner })
    }

    /// Emit `tick` to subscribers on every firing of `cron_expr`.
    pub async fn add_tick(&self, cron_expr: &str, dispatcher: Dispatcher) -> Result<()> {
        self.add_cron_job(cron_expr, "tick", move || {
            let dispatcher = dispatcher.clone();
            Box::pin(async move { dispatcher.emit(EventKind::Tick).await })
        })
        .await
    }

    /// Add a recurring cron job
    pub async fn add_cron_job<F>(&self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let job = Job::new_async(cron_expr, move |_uuid, _lock| task())
            .with_context(|| format!("Failed to create cron job '{}' ({})", name, cron_expr))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Scheduled '{}' with cron: {}", name, cron_expr);
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}
