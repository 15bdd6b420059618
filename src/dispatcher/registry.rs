use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Serialize;
use smallvec::SmallVec;

use crate::metrics::DispatchMetrics;

use super::Event;

/// Result returned by event handlers. An `Err` is logged and counted; it never
/// stops delivery to the other handlers.
pub type HandlerResult = anyhow::Result<()>;

/// Shared, type-erased event handler
pub type EventHandler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

/// Identifier of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    handler: EventHandler,
}

/// Outcome of dispatching one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Statistics for the event dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub dispatched: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    /// Events with no registered handler
    pub unhandled: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub dispatched: u64,
    pub delivered: u64,
    pub failed: u64,
    pub unhandled: u64,
}

/// In-process publish/subscribe keyed by event name.
///
/// Handlers for one name run in registration order. Registrations are logical:
/// they belong to the dispatcher, not to any physical connection, so they keep
/// firing across reconnects.
pub struct EventDispatcher {
    /// event name -> registrations in insertion order
    handlers: DashMap<String, SmallVec<[Registration; 4]>>,
    next_id: AtomicU64,
    stats: DispatcherStats,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
            stats: DispatcherStats::default(),
        }
    }

    /// Register `handler` for `event`. Dropping or unsubscribing the returned
    /// handle removes the registration.
    pub fn on<F>(self: &Arc<Self>, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_handler(event, Arc::new(handler))
    }

    /// Register an already shared handler (so it can later be passed to [`off`](Self::off))
    pub fn on_handler(
        self: &Arc<Self>,
        event: impl Into<String>,
        handler: EventHandler,
    ) -> Subscription {
        let event = event.into();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.handlers
            .entry(event.clone())
            .or_default()
            .push(Registration { id, handler });

        tracing::debug!(event = %event, subscription_id = id.0, "Handler registered");

        Subscription {
            event,
            id,
            dispatcher: Arc::downgrade(self),
            released: false,
        }
    }

    /// Remove exactly one registration of `handler` for `event`.
    /// Returns whether a registration was removed.
    pub fn off(&self, event: &str, handler: &EventHandler) -> bool {
        self.remove_where(event, |reg| Arc::ptr_eq(&reg.handler, handler))
    }

    /// Remove the registration with the given id
    pub fn off_id(&self, event: &str, id: SubscriptionId) -> bool {
        self.remove_where(event, |reg| reg.id == id)
    }

    fn remove_where(&self, event: &str, matches: impl Fn(&Registration) -> bool) -> bool {
        let removed = match self.handlers.get_mut(event) {
            Some(mut registrations) => match registrations.iter().position(|r| matches(r)) {
                Some(index) => {
                    let registration = registrations.remove(index);
                    tracing::debug!(
                        event = %event,
                        subscription_id = registration.id.0,
                        "Handler removed"
                    );
                    true
                }
                None => false,
            },
            None => false,
        };

        if removed {
            self.handlers.remove_if(event, |_, regs| regs.is_empty());
        }
        removed
    }

    /// Deliver `event` to every handler registered for its name.
    ///
    /// The handler list is snapshotted before any handler runs, so handlers may
    /// register or remove handlers without deadlocking. A handler that returns an
    /// error or panics is isolated from the others.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        DispatchMetrics::record_received(&event.name);

        let snapshot: SmallVec<[EventHandler; 4]> = match self.handlers.get(&event.name) {
            Some(registrations) => registrations.iter().map(|r| r.handler.clone()).collect(),
            None => SmallVec::new(),
        };

        if snapshot.is_empty() {
            self.stats.unhandled.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(event = %event.name, "No handlers registered for event");
            return DispatchReport::default();
        }

        let mut report = DispatchReport::default();
        for handler in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(event = %event.name, error = %e, "Event handler failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    tracing::error!(
                        event = %event.name,
                        panic = %panic_message(&*panic),
                        "Event handler panicked"
                    );
                }
            }
        }

        self.stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        if report.failed > 0 {
            DispatchMetrics::record_handler_failures(&event.name, report.failed as u64);
        }

        report
    }

    /// Number of handlers currently registered for `event`
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map(|r| r.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Registration handle returned by [`EventDispatcher::on`].
///
/// Released exactly once: by [`unsubscribe`](Self::unsubscribe) or on drop,
/// whichever comes first.
#[must_use = "dropping a Subscription removes its handler"]
pub struct Subscription {
    event: String,
    id: SubscriptionId,
    dispatcher: Weak<EventDispatcher>,
    released: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.off_id(&self.event, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> EventHandler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_factory = log.clone();
        let factory = move |tag: &str| -> EventHandler {
            let log = log_for_factory.clone();
            let tag = tag.to_string();
            Arc::new(move |event: &Event| {
                log.lock().unwrap().push(format!("{}:{}", tag, event.body));
                Ok(())
            })
        };
        (log, factory)
    }

    #[test]
    fn test_handlers_fire_in_registration_order() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let (log, handler) = recorder();

        let _a = dispatcher.on_handler("x", handler("a"));
        let _b = dispatcher.on_handler("x", handler("b"));
        let _other = dispatcher.on_handler("y", handler("y"));

        let report = dispatcher.dispatch(&Event::new("x", serde_json::json!(1)));
        assert_eq!(report, DispatchReport { delivered: 2, failed: 0 });
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_failing_handler_does_not_block_siblings() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let (log, handler) = recorder();

        let _err = dispatcher.on("x", |_| Err(anyhow::anyhow!("handler A failed")));
        let _panic = dispatcher.on("x", |_| panic!("handler B panicked"));
        let _ok = dispatcher.on_handler("x", handler("c"));

        let report = dispatcher.dispatch(&Event::new("x", serde_json::json!("e")));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(*log.lock().unwrap(), vec![r#"c:"e""#]);
        assert_eq!(dispatcher.stats().failed, 2);
    }

    #[test]
    fn test_off_removes_exactly_one_registration() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let (log, handler) = recorder();
        let shared = handler("h");

        let first = dispatcher.on_handler("x", shared.clone());
        let second = dispatcher.on_handler("x", shared.clone());
        assert_eq!(dispatcher.handler_count("x"), 2);

        assert!(dispatcher.off("x", &shared));
        assert_eq!(dispatcher.handler_count("x"), 1);
        assert!(!dispatcher.off("missing", &shared));

        dispatcher.dispatch(&Event::new("x", serde_json::json!(0)));
        assert_eq!(log.lock().unwrap().len(), 1);

        // Handles release by id, so releasing both is harmless
        first.unsubscribe();
        second.unsubscribe();
        assert_eq!(dispatcher.handler_count("x"), 0);
    }

    #[test]
    fn test_dropping_subscription_deregisters() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let (log, handler) = recorder();

        {
            let _sub = dispatcher.on_handler("x", handler("scoped"));
            assert_eq!(dispatcher.handler_count("x"), 1);
        }

        assert_eq!(dispatcher.handler_count("x"), 0);
        let report = dispatcher.dispatch(&Event::new("x", serde_json::json!(null)));
        assert_eq!(report.delivered, 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(dispatcher.stats().unhandled, 1);
    }

    #[test]
    fn test_handler_may_unsubscribe_during_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot_in_handler = slot.clone();
        let sub = dispatcher.on("x", move |_| {
            // one-shot handler
            slot_in_handler.lock().unwrap().take();
            Ok(())
        });
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(dispatcher.dispatch(&Event::new("x", serde_json::Value::Null)).delivered, 1);
        assert_eq!(dispatcher.handler_count("x"), 0);
        assert_eq!(dispatcher.dispatch(&Event::new("x", serde_json::Value::Null)).delivered, 0);
    }

    #[test]
    fn test_subscription_outliving_dispatcher_is_harmless() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let sub = dispatcher.on("x", |_| Ok(()));
        drop(dispatcher);
        sub.unsubscribe();
    }
}
