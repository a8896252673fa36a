//! Typed publish/subscribe event bus with an ordered middleware chain.
//!
//! Middleware runs strictly sequentially; any failure — an `Err` return or
//! a returned `None` — drops the event silently before it reaches the audit
//! log or any handler.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::events::Event;

/// Sequential middleware stage. Returning `Ok(None)` or `Err` cancels
/// delivery: the event is not logged and not dispatched to any handler.
/// A panic-free `Err` return stands in for the source's "middleware raised"
/// case.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process(&self, event: Event) -> anyhow::Result<Option<Event>>;
}

/// Subscriber callback. A handler that returns `Err` is logged and skipped;
/// it never affects sibling handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

type HandlerEntry = Arc<dyn EventHandler>;

const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// Deliver events to typed subscribers through an ordered middleware chain;
/// record an in-memory audit log bounded to `log_capacity` entries.
pub struct EventBus {
    subscribers: Mutex<HashMap<&'static str, Vec<HandlerEntry>>>,
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    event_log: Mutex<VecDeque<Event>>,
    log_capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            middlewares: Mutex::new(Vec::new()),
            event_log: Mutex::new(VecDeque::new()),
            log_capacity,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to a concrete event type. Idempotent per (type, handler):
    /// subscribing the same `Arc` twice for the same type is a no-op.
    pub fn subscribe(&self, event_type: &'static str, handler: HandlerEntry) {
        let mut subs = self.subscribers.lock();
        let entries = subs.entry(event_type).or_default();
        if !entries.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            entries.push(handler);
        }
    }

    /// Remove a previously registered handler. Returns `true` if removed.
    pub fn unsubscribe(&self, event_type: &'static str, handler: &HandlerEntry) -> bool {
        let mut subs = self.subscribers.lock();
        if let Some(entries) = subs.get_mut(event_type) {
            let before = entries.len();
            entries.retain(|h| !Arc::ptr_eq(h, handler));
            return before != entries.len();
        }
        false
    }

    /// Append to the ordered middleware chain.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares.lock().push(middleware);
    }

    pub fn subscriber_count(&self, event_type: &'static str) -> usize {
        self.subscribers
            .lock()
            .get(event_type)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped_by_middleware: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Read-only snapshot of the audit log, oldest first.
    pub fn event_log(&self) -> Vec<Event> {
        self.event_log.lock().iter().cloned().collect()
    }

    /// Run the middleware chain, append to the audit log, and dispatch to
    /// every handler subscribed to the event's concrete type at the moment
    /// of dispatch. Returns once dispatch has completed.
    pub async fn publish(&self, event: Event) {
        let middlewares: Vec<_> = self.middlewares.lock().clone();

        let mut current = event;
        for mw in &middlewares {
            match mw.process(current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    tracing::debug!("event blocked by middleware");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    tracing::error!(error = %err, "middleware raised, dropping event");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }

        let event = current;
        self.published.fetch_add(1, Ordering::Relaxed);
        self.record(event.clone());
        self.dispatch(&event).await;
    }

    fn record(&self, event: Event) {
        let mut log = self.event_log.lock();
        log.push_back(event);
        while log.len() > self.log_capacity {
            log.pop_front();
        }
    }

    async fn dispatch(&self, event: &Event) {
        let handlers: Vec<_> = {
            let subs = self.subscribers.lock();
            subs.get(event.type_name()).cloned().unwrap_or_default()
        };

        for handler in handlers {
            if let Err(err) = handler.handle(event).await {
                tracing::warn!(error = %err, event_type = event.type_name(), "handler failed");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventBusStats {
    pub published: u64,
    pub dropped_by_middleware: u64,
}
