//! Synchronous pub/sub for lifecycle events, mirroring the EventEmitter
//! pattern used by the reconnection/state layers to stay decoupled from
//! `ConnectionCore` itself.
//!
//! Subscribers are plain closures invoked inline during `emit`; there is no
//! queueing or async hop, so handlers must be quick and non-blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// A lifecycle event name and its payload. Names follow a `domain:action`
/// convention, e.g. `starling:connected`, `starling:reconnect:attempt`.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;
type Middleware = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct Subscription {
    id: u64,
    pattern: String,
    wildcard: bool,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    subscriptions: Vec<Subscription>,
    middleware: Vec<Middleware>,
}

/// Disposes a subscription or middleware registration when dropped is not
/// automatic; call `dispose()` explicitly (matching the teacher's explicit
/// unsubscribe handles rather than RAII, so callers can hold onto a
/// `Disposer` independently of the subscribing closure's lifetime).
pub struct Disposer {
    id: u64,
    bus: Arc<EventBus>,
}

impl Disposer {
    pub fn dispose(self) {
        self.bus.remove_subscription(self.id);
    }
}

/// Central event bus. Cheap to clone via `Arc<EventBus>`; every component
/// that needs to emit or observe lifecycle events holds a clone.
pub struct EventBus {
    inner: Mutex<Inner>,
    next_mw_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_mw_id: AtomicU64::new(0),
        }
    }

    /// Subscribe to an exact event name, or a `prefix:*` wildcard pattern
    /// that matches any event whose name starts with `prefix:`.
    pub fn subscribe<F>(self: &Arc<Self>, pattern: impl Into<String>, handler: F) -> Disposer
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        let wildcard = pattern.ends_with('*');
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscriptions.push(Subscription {
            id,
            pattern,
            wildcard,
            handler: Box::new(handler),
        });
        Disposer {
            id,
            bus: Arc::clone(self),
        }
    }

    /// Register middleware that runs before any subscriber, in registration
    /// order. Returning `false` stops the event from being delivered to
    /// subscribers (and to later middleware).
    pub fn use_middleware<F>(&self, middleware: F)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        inner.middleware.push(Box::new(middleware));
        self.next_mw_id.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit an event synchronously. Exact-name subscribers run before
    /// wildcard subscribers; within each group, handlers run in
    /// registration order.
    pub fn emit(&self, event: Event) {
        let inner = self.inner.lock().expect("event bus mutex poisoned");

        for mw in &inner.middleware {
            if !mw(&event) {
                return;
            }
        }

        for sub in inner.subscriptions.iter().filter(|s| !s.wildcard) {
            if sub.pattern == event.name {
                (sub.handler)(&event);
            }
        }
        for sub in inner.subscriptions.iter().filter(|s| s.wildcard) {
            let prefix = sub.pattern.trim_end_matches('*');
            if event.name.starts_with(prefix) {
                (sub.handler)(&event);
            }
        }
    }

    fn remove_subscription(&self, id: u64) {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        inner.subscriptions.retain(|s| s.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn exact_subscriber_receives_matching_event() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        bus.subscribe("starling:connected", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(Event::new("starling:connected", Value::Null));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exact_runs_before_wildcard() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        bus.subscribe("starling:reconnect:*", move |_| {
            o1.lock().unwrap().push("wildcard");
        });
        let o2 = Arc::clone(&order);
        bus.subscribe("starling:reconnect:attempt", move |_| {
            o2.lock().unwrap().push("exact");
        });
        bus.emit(Event::new("starling:reconnect:attempt", Value::Null));
        assert_eq!(*order.lock().unwrap(), vec!["exact", "wildcard"]);
    }

    #[test]
    fn middleware_can_suppress_delivery() {
        let bus = Arc::new(EventBus::new());
        bus.use_middleware(|e| e.name != "starling:error");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        bus.subscribe("starling:error", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(Event::new("starling:error", Value::Null));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disposed_subscription_stops_receiving() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let disposer = bus.subscribe("starling:connected", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        disposer.dispose();
        bus.emit(Event::new("starling:connected", Value::Null));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
