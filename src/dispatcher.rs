use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::api::User;
use crate::registry::{Context, SubscriberRegistry};
use crate::taxonomy::EventKind;
use crate::update::Update;

/// Completion signal for a batch. Consumed on use, so it fires at most once.
#[derive(Debug)]
pub struct Ack(oneshot::Sender<()>);

impl Ack {
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn complete(self) {
        // The receiver may be gone if the HTTP client disconnected.
        let _ = self.0.send(());
    }
}

struct Inner {
    registry: Arc<SubscriberRegistry>,
    bot: OnceLock<Arc<User>>,
}

/// Routes update batches to subscribers.
///
/// Cheap to clone; every transport shares one instance. It never mutates the
/// registry, so concurrent webhook requests can dispatch without extra locking.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                bot: OnceLock::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.inner.registry
    }

    /// Record the bot identity attached to every later context. Only the
    /// first call has an effect.
    pub fn set_bot_info(&self, me: User) {
        let _ = self.inner.bot.set(Arc::new(me));
    }

    pub fn bot_info(&self) -> Option<Arc<User>> {
        self.inner.bot.get().cloned()
    }

    /// Dispatch `updates` in order and return the next cursor value, or
    /// `None` for an empty batch.
    ///
    /// Each update's events (generic, primary, then derived) finish before
    /// the next update starts. `ack` is completed once, after the whole batch.
    pub async fn dispatch(&self, updates: Vec<Update>, ack: Option<Ack>) -> Option<i64> {
        let mut next_offset = None;

        for update in updates {
            let update_id = update.update_id;
            self.dispatch_one(Arc::new(update)).await;
            next_offset = Some(update_id.saturating_add(1));
        }

        if let Some(ack) = ack {
            ack.complete();
        }
        next_offset
    }

    async fn dispatch_one(&self, update: Arc<Update>) {
        let ctx = Arc::new(Context::for_update(update.clone(), self.bot_info()));

        self.emit_with(EventKind::Update, &ctx).await;

        let Some(kind) = update.kind.event_kind() else {
            debug!(
                update_id = update.update_id,
                "Skipping unrecognized update: {:?}", update.kind
            );
            return;
        };

        debug!(update_id = update.update_id, "Routing update as '{}'", kind);
        self.emit_with(kind, &ctx).await;

        if let (Some(binding), Some(payload)) = (kind.binding(), update.payload()) {
            for derived in binding.derived {
                if payload.has(derived.nested_field) {
                    self.emit_with(derived.kind, &ctx).await;
                }
            }
        }
    }

    /// Emit a lifecycle event (ready, tick, stopped).
    pub async fn emit(&self, kind: EventKind) {
        let ctx = Arc::new(Context::lifecycle(self.bot_info()));
        self.emit_with(kind, &ctx).await;
    }

    async fn emit_with(&self, kind: EventKind, ctx: &Arc<Context>) {
        for (id, handler) in self.inner.registry.handlers_for(kind) {
            let ctx = ctx.clone();
            // Calling the handler happens inside the guarded future, so a
            // panic while building its future is caught too.
            let outcome = AssertUnwindSafe(async move { handler(ctx).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    event = %kind,
                    subscription = ?id,
                    "Subscriber failed: {:#}",
                    e
                ),
                Err(panic) => error!(
                    event = %kind,
                    subscription = ?id,
                    "Subscriber panicked: {}",
                    panic_message(panic.as_ref())
                ),
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
