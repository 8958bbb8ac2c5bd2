//! Event bus - synchronous publish/subscribe for runtime events
//!
//! Handlers run on the publisher's task, in registration order. The handler
//! list is copy-on-write: `publish` works on a snapshot, so subscriptions
//! added or removed during delivery only affect later events.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use runtime_core::runtime::{ErrorOrigin, ErrorRecord, EventKind, RuntimeEvent};
use runtime_core::ErrorKind;

/// Which events a subscription receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Kind(EventKind),
}

impl EventFilter {
    pub fn matches(&self, event: &RuntimeEvent) -> bool {
        match self {
            Self::All => true,
            Self::Kind(kind) => event.kind() == *kind,
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        Self::Kind(kind)
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receives published events
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &RuntimeEvent) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&RuntimeEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &RuntimeEvent) -> anyhow::Result<()> {
        self(event)
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

/// Typed publish/subscribe dispatcher
pub struct EventBus {
    subscriptions: RwLock<Arc<Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a closure for events matching `filter`
    pub fn subscribe<F>(&self, filter: impl Into<EventFilter>, handler: F) -> SubscriptionId
    where
        F: Fn(&RuntimeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(filter, Arc::new(handler))
    }

    /// Register a closure for every event
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RuntimeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::All, handler)
    }

    /// Register a shared handler object
    pub fn subscribe_handler(
        &self,
        filter: impl Into<EventFilter>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut guard = self.subscriptions.write();
        let mut next: Vec<Subscription> = guard.iter().cloned().collect();
        next.push(Subscription {
            id,
            filter: filter.into(),
            handler,
        });
        *guard = Arc::new(next);

        id
    }

    /// Stream matching events into a channel, for front ends that consume
    /// progress on their own task
    pub fn subscribe_channel(
        &self,
        filter: impl Into<EventFilter>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(filter, move |event: &RuntimeEvent| {
            // A dropped receiver just stops listening
            let _ = tx.send(event.clone());
            Ok(())
        });
        (id, rx)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.subscriptions.write();
        if !guard.iter().any(|s| s.id == id) {
            return false;
        }

        let next: Vec<Subscription> = guard.iter().filter(|s| s.id != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Deliver an event to every matching handler.
    ///
    /// Handler failures (errors or panics) are re-published as
    /// `ErrorOccurred` with origin `Handler` and returned, in delivery order,
    /// so the publisher can record them next to the event. Failures while
    /// delivering such an event are only logged.
    pub fn publish(&self, event: &RuntimeEvent) -> Vec<RuntimeEvent> {
        let failures = self.deliver(event);
        if failures.is_empty() {
            return Vec::new();
        }

        if event.is_handler_error() {
            for failure in failures {
                warn!(
                    "Handler failed on handler-error event {}: {}",
                    event.id, failure
                );
            }
            return Vec::new();
        }

        let mut published = Vec::with_capacity(failures.len());
        for failure in failures {
            let error_event = RuntimeEvent::error_occurred(
                event.runtime_id,
                &event.agent_id,
                ErrorRecord::new(
                    ErrorKind::HandlerFailed,
                    format!("handler for {} failed: {}", event.kind().as_str(), failure),
                ),
                ErrorOrigin::Handler,
                event.call_id().map(str::to_string),
            );

            for nested in self.deliver(&error_event) {
                warn!(
                    "Handler failed on handler-error event {}: {}",
                    error_event.id, nested
                );
            }
            published.push(error_event);
        }

        published
    }

    fn deliver(&self, event: &RuntimeEvent) -> Vec<String> {
        let snapshot = self.subscriptions.read().clone();
        let mut failures = Vec::new();

        for subscription in snapshot.iter() {
            if !subscription.filter.matches(event) {
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| subscription.handler.handle(event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{:#}", err),
                Err(panic) => panic_message(panic.as_ref()),
            };

            debug!(
                "Subscription {:?} failed on {} event: {}",
                subscription.id,
                event.kind().as_str(),
                failure
            );
            failures.push(failure);
        }

        failures
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use runtime_core::runtime::{EventPayload, RuntimeStatus};
    use uuid::Uuid;

    fn before(runtime_id: Uuid, query: &str) -> RuntimeEvent {
        RuntimeEvent::before_invocation(runtime_id, "agent", query.to_string())
    }

    fn after(runtime_id: Uuid) -> RuntimeEvent {
        RuntimeEvent::after_invocation(runtime_id, "agent", RuntimeStatus::Completed, None, None)
    }

    type Recorded = Arc<Mutex<Vec<RuntimeEvent>>>;

    fn recorder() -> (
        Recorded,
        impl Fn(&RuntimeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |event: &RuntimeEvent| -> anyhow::Result<()> {
            sink.lock().push(event.clone());
            Ok(())
        };
        (seen, handler)
    }

    #[test]
    fn test_delivers_by_kind_in_publish_order() {
        let bus = EventBus::new();
        let (before_seen, before_handler) = recorder();
        let (all_seen, all_handler) = recorder();
        bus.subscribe(EventKind::BeforeInvocation, before_handler);
        bus.subscribe_all(all_handler);

        let id = Uuid::new_v4();
        bus.publish(&before(id, "one"));
        bus.publish(&after(id));
        bus.publish(&before(id, "two"));

        let queries: Vec<String> = before_seen
            .lock()
            .iter()
            .map(|e| match &e.payload {
                EventPayload::BeforeInvocation { query } => query.clone(),
                other => panic!("unexpected payload {:?}", other),
            })
            .collect();
        assert_eq!(queries, vec!["one", "two"]);
        assert_eq!(all_seen.lock().len(), 3);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe_all(move |_: &RuntimeEvent| {
                order.lock().push(n);
                Ok(())
            });
        }

        bus.publish(&before(Uuid::new_v4(), "q"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        bus.subscribe_all(|_: &RuntimeEvent| -> anyhow::Result<()> {
            anyhow::bail!("observer broke")
        });
        bus.subscribe(EventKind::BeforeInvocation, |_: &RuntimeEvent| -> anyhow::Result<()> {
            panic!("observer exploded")
        });
        let (seen, handler) = recorder();
        bus.subscribe_all(handler);

        let reported = bus.publish(&before(Uuid::new_v4(), "q"));

        let seen = seen.lock();
        assert_eq!(reported.as_slice(), &seen[1..]);
        // The original event plus one ErrorOccurred per failing handler
        assert_eq!(seen[0].kind(), EventKind::BeforeInvocation);
        let errors: Vec<&RuntimeEvent> = seen
            .iter()
            .filter(|e| e.kind() == EventKind::ErrorOccurred)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.is_handler_error()));
        match &errors[1].payload {
            EventPayload::ErrorOccurred { error, .. } => {
                assert_eq!(error.kind, ErrorKind::HandlerFailed);
                assert!(error.message.contains("observer exploded"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_error_handler_failures_do_not_recurse() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        bus.subscribe_all(move |_: &RuntimeEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always fails")
        });

        let reported = bus.publish(&before(Uuid::new_v4(), "q"));

        // Original event, then exactly one handler-error event
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(reported.len(), 1);
    }

    #[test]
    fn test_subscription_during_delivery_sees_only_later_events() {
        let bus = Arc::new(EventBus::new());
        let (late_seen, late_handler) = recorder();
        let late_handler = Arc::new(Mutex::new(Some(late_handler)));

        let bus_ref = Arc::clone(&bus);
        bus.subscribe_all(move |_: &RuntimeEvent| {
            if let Some(handler) = late_handler.lock().take() {
                bus_ref.subscribe_all(handler);
            }
            Ok(())
        });

        let id = Uuid::new_v4();
        bus.publish(&before(id, "first"));
        assert!(late_seen.lock().is_empty());

        bus.publish(&after(id));
        assert_eq!(late_seen.lock().len(), 1);
        assert_eq!(late_seen.lock()[0].kind(), EventKind::AfterInvocation);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let (seen, handler) = recorder();
        let id = bus.subscribe_all(handler);
        assert_eq!(bus.subscription_count(), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&before(Uuid::new_v4(), "q"));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_channel() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel(EventKind::AfterInvocation);

        let id = Uuid::new_v4();
        bus.publish(&before(id, "q"));
        bus.publish(&after(id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::AfterInvocation);
        assert!(rx.try_recv().is_err());
    }
}
