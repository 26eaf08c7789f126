//! In-process publish/subscribe
//!
//! Every manager owns its own `EventEmitter`; the facade subscribes to them
//! and re-publishes into its own instance. Delivery is synchronous and in
//! registration order.

pub mod types;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub use types::{
    DownloadProgressEvent, DownloaderEvent, ImportProgressEvent, ImportStatus,
    DOWNLOAD_PROGRESS, IMPORT_PROGRESS, MODELS_CHANGED,
};

/// Events that can be routed by name
pub trait NamedEvent: Clone + Send + Sync + 'static {
    fn name(&self) -> &'static str;
}

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by `on`, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener<E> {
    id: ListenerId,
    event: String,
    handler: Handler<E>,
}

pub struct EventEmitter<E> {
    listeners: Mutex<Vec<Listener<E>>>,
    next_id: AtomicU64,
}

impl<E: NamedEvent> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for the named event
    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock().push(Listener {
            id,
            event: event.to_string(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Unregister a handler. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().iter().filter(|l| l.event == event).count()
    }

    /// Deliver `event` to every handler registered for its name.
    /// Returns the number of handlers called.
    pub fn emit(&self, event: &E) -> usize {
        let name = event.name();
        // Snapshot so handlers can call on/off without deadlocking
        let handlers: Vec<Handler<E>> = self
            .lock()
            .iter()
            .filter(|l| l.event == name)
            .map(|l| Arc::clone(&l.handler))
            .collect();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Listener<E>>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<E: NamedEvent> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Debug, PartialEq)]
    enum TestEvent {
        Ping(u32),
        Pong,
    }

    impl NamedEvent for TestEvent {
        fn name(&self) -> &'static str {
            match self {
                TestEvent::Ping(_) => "ping",
                TestEvent::Pong => "pong",
            }
        }
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let emitter = EventEmitter::<TestEvent>::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            emitter.on("ping", move |_| seen.lock().unwrap().push(tag));
        }

        assert_eq!(emitter.emit(&TestEvent::Ping(1)), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_only_matching_name_is_delivered() {
        let emitter = EventEmitter::<TestEvent>::new();
        let pings = Arc::new(StdMutex::new(0));
        {
            let pings = pings.clone();
            emitter.on("ping", move |_| *pings.lock().unwrap() += 1);
        }

        assert_eq!(emitter.emit(&TestEvent::Pong), 0);
        emitter.emit(&TestEvent::Ping(7));
        assert_eq!(*pings.lock().unwrap(), 1);
    }

    #[test]
    fn test_off_removes_handler() {
        let emitter = EventEmitter::<TestEvent>::new();
        let id = emitter.on("ping", |_| {});
        emitter.on("ping", |_| {});

        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        assert_eq!(emitter.listener_count("ping"), 1);
        assert_eq!(emitter.emit(&TestEvent::Ping(0)), 1);
    }

    #[test]
    fn test_handler_can_unsubscribe_during_emit() {
        let emitter = Arc::new(EventEmitter::<TestEvent>::new());
        let slot: Arc<StdMutex<Option<ListenerId>>> = Arc::new(StdMutex::new(None));

        let id = {
            let emitter = emitter.clone();
            let slot = slot.clone();
            emitter.clone().on("ping", move |_| {
                if let Some(id) = slot.lock().unwrap().take() {
                    emitter.off(id);
                }
            })
        };
        *slot.lock().unwrap() = Some(id);

        assert_eq!(emitter.emit(&TestEvent::Ping(1)), 1);
        assert_eq!(emitter.emit(&TestEvent::Ping(2)), 0);
    }

    #[test]
    fn test_instances_are_independent() {
        let a = EventEmitter::<TestEvent>::new();
        let b = EventEmitter::<TestEvent>::new();
        a.on("pong", |_| {});

        assert_eq!(a.listener_count("pong"), 1);
        assert_eq!(b.listener_count("pong"), 0);
        assert_eq!(b.emit(&TestEvent::Pong), 0);
    }
}
