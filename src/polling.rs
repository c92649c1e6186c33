use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::api::{ApiError, FetchOptions, UpdateSource};
use crate::dispatcher::Dispatcher;

#[derive(Debug, Clone, PartialEq)]
pub struct PollingOptions {
    /// First offset to request.
    pub offset: i64,
    pub fetch: FetchOptions,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

/// Cooperative stop switch for a [`Poller`].
///
/// Closing takes effect at the start of the next loop iteration; a fetch that
/// is already in flight is allowed to finish.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn close(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Long-polling driver: fetch a batch, dispatch it, advance the offset, repeat.
///
/// Only one fetch is ever outstanding and no fetch is issued while a batch is
/// being dispatched. The offset lives in memory only.
pub struct Poller {
    source: Arc<dyn UpdateSource>,
    dispatcher: Dispatcher,
    options: PollingOptions,
    offset: i64,
    running: StopHandle,
}

impl Poller {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        dispatcher: Dispatcher,
        options: PollingOptions,
    ) -> Self {
        Self {
            source,
            dispatcher,
            offset: options.offset,
            options,
            running: StopHandle(Arc::new(AtomicBool::new(true))),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.running.clone()
    }

    #[allow(dead_code)]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Run until closed or until the API reports an error retrying cannot fix.
    ///
    /// Transient failures are retried after `retry_after` when the server
    /// sends one, otherwise after an exponential backoff capped at
    /// `retry_max_delay`.
    pub async fn start(&mut self) -> Result<(), ApiError> {
        info!("Polling for updates from offset {}", self.offset);

        let mut failures: u32 = 0;
        let mut advanced = false;

        let result = loop {
            if !self.running.is_running() {
                break Ok(());
            }

            match self
                .source
                .fetch_updates(self.offset, &self.options.fetch)
                .await
            {
                Ok(updates) => {
                    failures = 0;
                    if !updates.is_empty() {
                        debug!("Fetched {} update(s) at offset {}", updates.len(), self.offset);
                    }
                    if let Some(next) = self.dispatcher.dispatch(updates, None).await {
                        self.offset = next;
                        advanced = true;
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!("Polling stopped by fatal API error: {}", e);
                    break Err(e);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff_delay(
                        &e,
                        failures,
                        self.options.retry_base_delay,
                        self.options.retry_max_delay,
                    );
                    warn!(
                        "Failed to fetch updates (attempt {}): {}; retrying in {:?}",
                        failures, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        self.running.close();
        if advanced {
            self.confirm_offset().await;
        }
        info!("Polling stopped at offset {}", self.offset);
        result
    }

    /// Tell the server the last dispatched batch was consumed, so a restart
    /// does not receive it again.
    async fn confirm_offset(&self) {
        let options = FetchOptions {
            limit: 1,
            timeout: 0,
            allowed_updates: self.options.fetch.allowed_updates.clone(),
        };
        if let Err(e) = self.source.fetch_updates(self.offset, &options).await {
            warn!("Failed to confirm offset {}: {}", self.offset, e);
        }
    }
}

fn backoff_delay(error: &ApiError, failures: u32, base: Duration, max: Duration) -> Duration {
    if let Some(wait) = error.retry_after() {
        return wait;
    }
    let shift = failures.saturating_sub(1).min(16);
    base.saturating_mul(1 << shift).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SubscriberRegistry;
    use crate::taxonomy::EventKind;
    use crate::update::Update;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Mutex, OnceLock};

    /// Replays a fixed script of fetch results, recording every call, and
    /// closes the poller once the script runs out.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<Update>, ApiError>>>,
        calls: Mutex<Vec<(i64, u32)>>,
        stop: OnceLock<StopHandle>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<Update>, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                stop: OnceLock::new(),
            })
        }

        fn calls(&self) -> Vec<(i64, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpdateSource for ScriptedSource {
        async fn fetch_updates(
            &self,
            offset: i64,
            options: &FetchOptions,
        ) -> Result<Vec<Update>, ApiError> {
            self.calls.lock().unwrap().push((offset, options.limit));
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => {
                    if let Some(stop) = self.stop.get() {
                        stop.close();
                    }
                    Ok(Vec::new())
                }
            }
        }
    }

    fn batch(ids: &[i64]) -> Result<Vec<Update>, ApiError> {
        Ok(ids
            .iter()
            .map(|id| Update::from_value(json!({ "update_id": id, "message": {} })).unwrap())
            .collect())
    }

    fn api_error(code: i64, retry_after: Option<u64>) -> Result<Vec<Update>, ApiError> {
        Err(ApiError::Api {
            method: "getUpdates",
            code,
            description: "test".to_string(),
            retry_after,
        })
    }

    fn options() -> PollingOptions {
        PollingOptions {
            offset: 0,
            fetch: FetchOptions {
                limit: 100,
                timeout: 30,
                allowed_updates: Vec::new(),
            },
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
        }
    }

    fn poller(source: &Arc<ScriptedSource>, registry: Arc<SubscriberRegistry>) -> Poller {
        let poller = Poller::new(source.clone(), Dispatcher::new(registry), options());
        let _ = source.stop.set(poller.stop_handle());
        poller
    }

    #[tokio::test]
    async fn test_second_cycle_uses_cursor_from_first() {
        let source = ScriptedSource::new(vec![batch(&[5, 6]), batch(&[])]);
        let mut poller = poller(&source, Arc::new(SubscriberRegistry::new()));

        poller.start().await.unwrap();

        let calls = source.calls();
        assert_eq!(calls[0], (0, 100));
        assert_eq!(calls[1], (7, 100));
        assert_eq!(poller.offset(), 7);
        // Final call confirms the offset with a one-update limit.
        assert_eq!(calls.last(), Some(&(7, 1)));
    }

    #[tokio::test]
    async fn test_empty_batches_keep_the_cursor() {
        let source = ScriptedSource::new(vec![batch(&[3]), batch(&[]), batch(&[])]);
        let mut poller = poller(&source, Arc::new(SubscriberRegistry::new()));

        poller.start().await.unwrap();

        let offsets: Vec<i64> = source.calls().iter().map(|c| c.0).collect();
        assert_eq!(offsets, vec![0, 4, 4, 4, 4]);
    }

    #[tokio::test]
    async fn test_dispatches_fetched_updates() {
        let registry = Arc::new(SubscriberRegistry::new());
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = seen.clone();
        registry.subscribe(EventKind::Message, move |ctx| {
            let seen = handler_seen.clone();
            async move {
                seen.lock().unwrap().extend(ctx.update_id());
                Ok(())
            }
        });
        let source = ScriptedSource::new(vec![batch(&[1, 2]), batch(&[3])]);
        let mut poller = poller(&source, registry);

        poller.start().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let source = ScriptedSource::new(vec![
            api_error(502, None),
            api_error(429, Some(0)),
            batch(&[9]),
        ]);
        let mut poller = poller(&source, Arc::new(SubscriberRegistry::new()));

        poller.start().await.unwrap();

        let offsets: Vec<i64> = source.calls().iter().map(|c| c.0).collect();
        assert_eq!(offsets[..4].to_vec(), vec![0, 0, 0, 10]);
        assert_eq!(poller.offset(), 10);
    }

    #[tokio::test]
    async fn test_fatal_error_ends_the_loop() {
        let source = ScriptedSource::new(vec![api_error(409, None), batch(&[1])]);
        let mut poller = poller(&source, Arc::new(SubscriberRegistry::new()));
        let handle = poller.stop_handle();

        let err = poller.start().await.unwrap_err();

        assert!(err.is_fatal());
        assert!(!handle.is_running());
        // No retry and nothing to confirm.
        assert_eq!(source.calls(), vec![(0, 100)]);
    }

    #[tokio::test]
    async fn test_close_before_start_issues_no_fetch() {
        let source = ScriptedSource::new(vec![batch(&[1])]);
        let mut poller = poller(&source, Arc::new(SubscriberRegistry::new()));
        poller.stop_handle().close();

        poller.start().await.unwrap();
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn test_close_from_subscriber_finishes_current_batch() {
        let registry = Arc::new(SubscriberRegistry::new());
        let source = ScriptedSource::new(vec![batch(&[1, 2]), batch(&[3])]);
        let mut poller = Poller::new(source.clone(), Dispatcher::new(registry.clone()), options());
        let handle = poller.stop_handle();
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = seen.clone();
        registry.subscribe(EventKind::Message, move |ctx| {
            let seen = handler_seen.clone();
            let handle = handle.clone();
            async move {
                seen.lock().unwrap().extend(ctx.update_id());
                handle.close();
                Ok(())
            }
        });

        poller.start().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(poller.offset(), 3);
        assert_eq!(source.calls(), vec![(0, 100), (3, 1)]);
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        let transient = ApiError::Api {
            method: "getUpdates",
            code: 500,
            description: String::new(),
            retry_after: None,
        };
        let throttled = ApiError::Api {
            method: "getUpdates",
            code: 429,
            description: String::new(),
            retry_after: Some(3),
        };

        assert_eq!(backoff_delay(&transient, 1, base, max), base);
        assert_eq!(backoff_delay(&transient, 3, base, max), Duration::from_millis(400));
        assert_eq!(backoff_delay(&transient, 40, base, max), max);
        assert_eq!(backoff_delay(&throttled, 1, base, max), Duration::from_secs(3));
    }
}
