use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::types::{AppEvent, Binding, EventListener};

/// Dispatcher for application lifecycle events.
///
/// Each event is delivered at most once per bus: the first `emit` runs every
/// listener bound to it, later calls are ignored. Listeners bound after an
/// event was dispatched are never invoked for it; callers that care use
/// [`EventBus::is_dispatched`] to detect that case.
pub struct EventBus {
    /// Kept in registration order.
    bindings: RwLock<Vec<Binding>>,
    dispatched: [AtomicBool; AppEvent::COUNT],
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(Vec::new()),
            dispatched: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    /// Bind a listener to `event`.
    pub fn bind(&self, name: impl Into<String>, event: AppEvent, listener: Arc<dyn EventListener>) {
        let name = name.into();
        debug!(listener = %name, %event, "listener bound");
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.push(Binding {
            name,
            event,
            listener,
        });
    }

    /// Bind a closure to `event`.
    pub fn on<F>(&self, name: impl Into<String>, event: AppEvent, f: F)
    where
        F: Fn(AppEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.bind(name, event, Arc::new(f));
    }

    /// Remove every listener registered under `name`. Silent no-op if none match.
    pub fn unbind(&self, name: &str) {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        let before = bindings.len();
        bindings.retain(|b| b.name != name);
        if bindings.len() < before {
            debug!(listener = name, "listener unbound");
        }
    }

    /// Whether `event` has already been emitted on this bus.
    pub fn is_dispatched(&self, event: AppEvent) -> bool {
        self.dispatched[event.index()].load(Ordering::Acquire)
    }

    /// Dispatch `event` to its listeners, synchronously and in registration order.
    ///
    /// A failing listener is logged and does not prevent the remaining ones
    /// from running. Returns the number of listeners invoked (0 when the event
    /// had already been dispatched).
    pub fn emit(&self, event: AppEvent) -> usize {
        if self.dispatched[event.index()].swap(true, Ordering::AcqRel) {
            warn!(%event, "event already dispatched, ignoring");
            return 0;
        }

        // Snapshot the listeners so that a listener may bind or unbind
        // without deadlocking against the read lock.
        let listeners: Vec<(String, Arc<dyn EventListener>)> = {
            let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
            bindings
                .iter()
                .filter(|b| b.event == event)
                .map(|b| (b.name.clone(), Arc::clone(&b.listener)))
                .collect()
        };

        info!(%event, listeners = listeners.len(), "dispatching lifecycle event");

        for (name, listener) in &listeners {
            let t = Instant::now();
            let result = listener.on_event(event);
            let elapsed_ms = t.elapsed().as_millis() as u64;

            match result {
                Ok(()) => debug!(listener = %name, %event, duration_ms = elapsed_ms, "listener completed"),
                Err(e) => error!(
                    listener = %name,
                    %event,
                    duration_ms = elapsed_ms,
                    error = %e,
                    "listener failed"
                ),
            }
        }

        listeners.len()
    }

    /// Emit, in order, every event up to and including `last` that has not
    /// been dispatched yet.
    pub fn emit_all_through(&self, last: AppEvent) {
        for event in AppEvent::ALL.into_iter().take_while(|e| *e <= last) {
            if !self.is_dispatched(event) {
                self.emit(event);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::EventError;

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            bus.on(tag, AppEvent::Start, move |_| {
                seen.lock().unwrap().push(tag);
                Ok(())
            });
        }

        assert_eq!(bus.emit(AppEvent::Start), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn event_is_dispatched_at_most_once() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        bus.on("counter", AppEvent::Stop, move |_| {
            *c.lock().unwrap() += 1;
            Ok(())
        });

        assert!(!bus.is_dispatched(AppEvent::Stop));
        bus.emit(AppEvent::Stop);
        assert_eq!(bus.emit(AppEvent::Stop), 0);
        assert!(bus.is_dispatched(AppEvent::Stop));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn failing_listener_does_not_stop_the_rest() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));
        bus.on("broken", AppEvent::PreStart, |_| {
            Err(EventError::ListenerFailed {
                listener: "broken".into(),
                reason: "boom".into(),
            })
        });
        let r = Arc::clone(&reached);
        bus.on("after-broken", AppEvent::PreStart, move |_| {
            *r.lock().unwrap() = true;
            Ok(())
        });

        assert_eq!(bus.emit(AppEvent::PreStart), 2);
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn listener_may_bind_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.on("binder", AppEvent::ClassLoaded, move |_| {
            inner.on("late", AppEvent::Start, |_| Ok(()));
            Ok(())
        });

        bus.emit(AppEvent::ClassLoaded);
        assert_eq!(bus.emit(AppEvent::Start), 1);
    }

    #[test]
    fn unbind_removes_by_name() {
        let bus = EventBus::new();
        bus.on("gone", AppEvent::Start, |_| Ok(()));
        bus.unbind("gone");
        assert_eq!(bus.emit(AppEvent::Start), 0);
    }

    #[test]
    fn emit_all_through_follows_declared_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for event in AppEvent::ALL {
            let seen = Arc::clone(&seen);
            bus.on("recorder", event, move |e| {
                seen.lock().unwrap().push(e);
                Ok(())
            });
        }

        bus.emit(AppEvent::DbServiceLoaded);
        bus.emit_all_through(AppEvent::Start);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &AppEvent::ALL[..AppEvent::Start.index() + 1]);
        assert!(!bus.is_dispatched(AppEvent::Stop));
    }
}
