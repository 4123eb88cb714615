//! Routes completed messages to the handlers subscribed to their topic.
//!
//! The registry is owned by whoever embeds the transport; the router only
//! asks it for the current handler set and fans the message out. A
//! failing or panicking handler is logged and never affects its siblings.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use dgbus_core::Message;

use crate::executor::BackgroundExecutor;
use crate::stats::DeliveryStats;

/// A subscriber to one or more topics.
pub trait Handler: Send + Sync {
    /// Used in logs when the handler fails.
    fn name(&self) -> &str;

    fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Source of handlers for a topic. Must tolerate concurrent lookups
/// while subscriptions change.
pub trait HandlerRegistry: Send + Sync {
    fn handlers_for(&self, topic: &str) -> Vec<Arc<dyn Handler>>;
}

/// Adapts a closure into a `Handler`.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            f,
        })
    }
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self.f)(message)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// In-memory topic → handlers map.
#[derive(Clone, Default)]
pub struct TopicRegistry {
    topics: Arc<DashMap<String, Vec<Arc<dyn Handler>>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: impl Into<String>, handler: Arc<dyn Handler>) {
        self.topics.entry(topic.into()).or_default().push(handler);
    }

    /// Remove every handler named `name` from `topic`. Returns how many went.
    pub fn unsubscribe(&self, topic: &str, name: &str) -> usize {
        let removed = match self.topics.get_mut(topic) {
            Some(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|h| h.name() != name);
                before - handlers.len()
            }
            None => 0,
        };
        self.topics.remove_if(topic, |_, handlers| handlers.is_empty());
        removed
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|h| h.len()).unwrap_or(0)
    }
}

impl HandlerRegistry for TopicRegistry {
    fn handlers_for(&self, topic: &str) -> Vec<Arc<dyn Handler>> {
        self.topics
            .get(topic)
            .map(|handlers| handlers.clone())
            .unwrap_or_default()
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

pub struct DispatchRouter {
    registry: Arc<dyn HandlerRegistry>,
    /// `None` runs handlers on the calling task.
    executor: Option<BackgroundExecutor>,
    stats: Arc<DeliveryStats>,
}

impl DispatchRouter {
    pub fn new(
        registry: Arc<dyn HandlerRegistry>,
        executor: Option<BackgroundExecutor>,
        stats: Arc<DeliveryStats>,
    ) -> Self {
        Self {
            registry,
            executor,
            stats,
        }
    }

    pub fn inline(registry: Arc<dyn HandlerRegistry>) -> Self {
        Self::new(registry, None, Arc::new(DeliveryStats::new()))
    }

    pub fn handlers_for(&self, topic: &str) -> Vec<Arc<dyn Handler>> {
        self.registry.handlers_for(topic)
    }

    /// Hand `message` to each handler. Returns the number of handlers it
    /// was given to; in background mode they may still be running.
    pub fn dispatch(&self, message: Arc<Message>, handlers: Vec<Arc<dyn Handler>>) -> usize {
        let count = handlers.len();
        for handler in handlers {
            match &self.executor {
                Some(executor) => {
                    let message = message.clone();
                    let stats = self.stats.clone();
                    executor.submit(move || {
                        stats.record_handler(run_handler(handler.as_ref(), &message));
                    });
                }
                None => {
                    self.stats
                        .record_handler(run_handler(handler.as_ref(), &message));
                }
            }
        }
        count
    }
}

/// Run one handler, containing both errors and panics. Returns success.
fn run_handler(handler: &dyn Handler, message: &Message) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(
                handler = handler.name(),
                topic = %message.topic,
                error = %e,
                "handler failed"
            );
            false
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic".to_string());
            tracing::warn!(
                handler = handler.name(),
                topic = %message.topic,
                panic = %reason,
                "handler panicked"
            );
            false
        }
    }
}
