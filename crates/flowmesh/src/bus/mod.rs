//! In-process event bus: the only point at which orchestration handlers run
//! (spec.md §4.1).
//!
//! `publish` dispatches to every subscriber of `event.type`, in registration
//! order, awaiting each handler before invoking the next. A handler that
//! returns an error is logged and does not block the handlers after it —
//! the bus never propagates a handler failure to the publisher, matching
//! the "duplicate-safe handlers are required" error model (spec.md §7).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::model::event::Event;

/// Result type every bus handler must return. `Err` is logged, never
/// propagated to the publisher or to later handlers.
pub type HandlerResult = Result<(), anyhow::Error>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Token returned by [`EventBus::on_type`]; dropping it does *not*
/// unsubscribe — call [`Unsubscribe::call`] (or just `unsubscribe()`)
/// explicitly, matching the teacher's explicit-disposal idiom over
/// drop-guards for cross-task-shared state.
pub struct Unsubscribe {
    bus: EventBus,
    event_type: String,
    id: u64,
}

impl Unsubscribe {
    pub fn call(self) {
        self.bus.remove_handler(&self.event_type, self.id);
    }
}

struct Registration {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

/// Process-wide publish/subscribe bus, keyed by event type.
///
/// Cheaply `Clone`-able (an `Arc` around shared state), so every component
/// that needs to publish or subscribe holds its own handle rather than
/// reaching through a global — per spec.md §9's "no globals" design note.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`. Handlers for the same type run
    /// in registration order on every `publish`.
    pub fn on_type<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> Unsubscribe
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let event_type = event_type.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.inner
            .handlers
            .write()
            .entry(event_type.clone())
            .or_default()
            .push(Registration { id, handler });
        Unsubscribe {
            bus: self.clone(),
            event_type,
            id,
        }
    }

    fn remove_handler(&self, event_type: &str, id: u64) {
        if let Some(registrations) = self.inner.handlers.write().get_mut(event_type) {
            registrations.retain(|r| r.id != id);
        }
    }

    /// Number of handlers currently registered for `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .handlers
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Dispatch `event` to all subscribers of `event.event_type()`, in
    /// registration order, awaiting each before the next runs.
    #[tracing::instrument(skip(self, event), fields(event.r#type = %event.event_type(), run_id = %event.run_id))]
    pub async fn publish(&self, event: Event) {
        // Snapshot the handler list so a handler that subscribes/unsubscribes
        // mid-dispatch doesn't affect this dispatch's set.
        let handlers: Vec<Handler> = {
            let guard = self.inner.handlers.read();
            guard
                .get(event.event_type())
                .map(|regs| regs.iter().map(|r| r.handler.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            if let Err(err) = handler(event.clone()).await {
                tracing::error!(error = %err, event.r#type = %event.event_type(), run_id = %event.run_id, "event bus handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::event::{Event, EventType};
    use std::sync::atomic::AtomicUsize;

    fn test_event(event_type: EventType) -> Event {
        Event::ingress(event_type, "run-1".to_string(), "flow-1".to_string(), serde_json::json!({}))
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.on_type("flow.start", move |_| {
            let o1 = o1.clone();
            async move {
                o1.lock().push(1);
                Ok(())
            }
        });
        let o2 = order.clone();
        bus.on_type("flow.start", move |_| {
            let o2 = o2.clone();
            async move {
                o2.lock().push(2);
                Ok(())
            }
        });

        bus.publish(test_event(EventType::FlowStart)).await;
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn handler_error_does_not_block_later_handlers() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));
        bus.on_type("flow.start", |_| async { Err(anyhow::anyhow!("boom")) });
        let ran2 = ran.clone();
        bus.on_type("flow.start", move |_| {
            let ran2 = ran2.clone();
            async move {
                ran2.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });
        bus.publish(test_event(EventType::FlowStart)).await;
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let unsub = bus.on_type("flow.start", move |_| {
            let ran2 = ran2.clone();
            async move {
                ran2.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });
        unsub.call();
        bus.publish(test_event(EventType::FlowStart)).await;
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn subscriber_count_reflects_registrations() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count("flow.start"), 0);
        bus.on_type("flow.start", |_| async { Ok(()) });
        assert_eq!(bus.subscriber_count("flow.start"), 1);
    }
}
