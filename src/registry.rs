use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::api::User;
use crate::taxonomy::EventKind;
use crate::update::{Payload, Update};

/// What every subscriber receives.
///
/// For envelope-derived events the same context is handed to the `update`,
/// primary and derived subscribers of one update. Lifecycle events carry no
/// update.
#[derive(Debug, Clone)]
pub struct Context {
    pub update: Option<Arc<Update>>,
    /// Identity of the bot, once `getMe` has resolved it.
    pub bot: Option<Arc<User>>,
    pub emitted_at: DateTime<Utc>,
}

impl Context {
    pub fn for_update(update: Arc<Update>, bot: Option<Arc<User>>) -> Self {
        Self {
            update: Some(update),
            bot,
            emitted_at: Utc::now(),
        }
    }

    pub fn lifecycle(bot: Option<Arc<User>>) -> Self {
        Self {
            update: None,
            bot,
            emitted_at: Utc::now(),
        }
    }

    pub fn update_id(&self) -> Option<i64> {
        self.update.as_ref().map(|u| u.update_id)
    }

    /// The classified payload (e.g. the message object for `message`).
    #[allow(dead_code)]
    pub fn payload(&self) -> Option<&Payload> {
        self.update.as_deref().and_then(Update::payload)
    }
}

pub type HandlerResult = anyhow::Result<()>;

pub(crate) type BoxedHandler =
    Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Event kind → ordered list of handlers.
///
/// Owned by the embedding application and shared with the dispatcher. Only
/// `subscribe`/`unsubscribe` mutate it; handlers never run under the lock.
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, BoxedHandler)>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler; handlers of one kind run in registration order.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let boxed: BoxedHandler = Arc::new(move |ctx: Arc<Context>| handler(ctx).boxed());

        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, boxed));

        debug!("Subscribed {:?} to '{}'", id, kind);
        id
    }

    /// Remove one handler. Returns false if the id was not registered.
    #[allow(dead_code)]
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(sub, _)| *sub == id) {
                list.remove(pos);
                debug!("Unsubscribed {:?}", id);
                return true;
            }
        }
        false
    }

    #[allow(dead_code)]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Snapshot of the handlers for `kind`, taken so no lock is held while
    /// they run.
    pub(crate) fn handlers_for(&self, kind: EventKind) -> Vec<(SubscriptionId, BoxedHandler)> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
