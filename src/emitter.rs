//! Name-keyed event emitter.
//!
//! Listeners register under an event name and receive [`Event`] payloads.
//! Synchronous listeners run inline in registration order; asynchronous
//! listeners are spawned on the runtime and their failures are logged, never
//! propagated. `emit` snapshots the listener list first, so removing a
//! listener during a fan-out does not perturb the fan-out in progress.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::event::Event;

/// Handle identifying a registered listener; closures are not comparable, so
/// removal goes through the id returned at registration.
pub type ListenerId = u64;

/// Error type asynchronous listeners may return; it is logged at `warn`.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type SyncFn = Arc<dyn Fn(&Event) + Send + Sync>;
type AsyncFn = Arc<
    dyn Fn(Event) -> Pin<Box<dyn Future<Output = std::result::Result<(), ListenerError>> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
enum Callback {
    Sync(SyncFn),
    Async(AsyncFn),
}

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    once: bool,
    callback: Callback,
}

#[derive(Default)]
pub struct EventEmitter {
    listeners: Mutex<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, event: &str, once: bool, callback: Callback) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, once, callback });
        id
    }

    /// Register a synchronous listener.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(event, false, Callback::Sync(Arc::new(listener)))
    }

    /// Register an asynchronous listener. It is spawned for each emission;
    /// errors are logged and swallowed.
    pub fn on_async<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(Event) -> Pin<Box<dyn Future<Output = std::result::Result<(), ListenerError>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        self.register(event, false, Callback::Async(Arc::new(listener)))
    }

    /// Register a one-shot listener, deregistered before its first invocation.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(event, true, Callback::Sync(Arc::new(listener)))
    }

    /// Remove a listener by id. Returns whether anything was removed.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut map = self.listeners.lock().unwrap();
        let Some(list) = map.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|reg| reg.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(event);
        }
        removed
    }

    /// Remove every listener for `event`, or all listeners when `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        let mut map = self.listeners.lock().unwrap();
        match event {
            Some(event) => {
                map.remove(event);
            }
            None => map.clear(),
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Dispatch `payload` to every listener of `event`. Returns whether any
    /// listener was registered.
    pub fn emit(&self, event: &str, payload: &Event) -> bool {
        let snapshot = {
            let mut map = self.listeners.lock().unwrap();
            let Some(list) = map.get_mut(event) else {
                return false;
            };
            let snapshot: Vec<Registration> = list.clone();
            list.retain(|reg| !reg.once);
            if list.is_empty() {
                map.remove(event);
            }
            snapshot
        };
        if snapshot.is_empty() {
            return false;
        }
        for registration in snapshot {
            match registration.callback {
                Callback::Sync(f) => f(payload),
                Callback::Async(f) => {
                    let fut = f(payload.clone());
                    let name = event.to_string();
                    tokio::spawn(async move {
                        if let Err(error) = fut.await {
                            tracing::warn!(event = %name, %error, "event listener failed");
                        }
                    });
                }
            }
        }
        true
    }

    /// Dispatch one payload under several event names, in order.
    pub fn emit_many(&self, events: &[&str], payload: &Event) {
        for event in events {
            self.emit(event, payload);
        }
    }

    /// Wait for the next emission of `event` matching `predicate`.
    ///
    /// The temporary listener is removed on resolution, timeout, or when the
    /// returned future is dropped.
    pub async fn wait_for<P>(&self, event: &str, predicate: P, timeout: Duration) -> Result<Event>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let id = self.on(event, move |payload| {
            if !predicate(payload) {
                return;
            }
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(payload.clone());
            }
        });
        let guard = RemoveOnDrop {
            emitter: self,
            event,
            id,
        };
        let result = tokio::time::timeout(timeout, rx).await;
        drop(guard);
        match result {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout {
                command: event.to_string(),
            }),
        }
    }
}

struct RemoveOnDrop<'a> {
    emitter: &'a EventEmitter,
    event: &'a str,
    id: ListenerId,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        self.emitter.off(self.event, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ping() -> Event {
        Event::Ping
    }

    #[tokio::test]
    async fn listeners_run_in_registration_order() {
        let emitter = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            emitter.on("ping", move |_| order.lock().unwrap().push(n));
        }
        assert!(emitter.emit("ping", &ping()));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn once_fires_exactly_once() {
        let emitter = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        emitter.once("ping", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit("ping", &ping());
        emitter.emit("ping", &ping());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count("ping"), 0);
    }

    #[tokio::test]
    async fn off_during_emission_does_not_skip_other_listeners() {
        let emitter = Arc::new(EventEmitter::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let self_id = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let em = emitter.clone();
        let id_slot = self_id.clone();
        let id = emitter.on("ping", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            em.off("ping", *id_slot.lock().unwrap());
        });
        *self_id.lock().unwrap() = id;

        let counter = hits.clone();
        emitter.on("ping", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit("ping", &ping());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Self-removed listener stays gone on the next emission.
        emitter.emit("ping", &ping());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn async_listener_runs_and_errors_are_swallowed() {
        let emitter = EventEmitter::new();
        let (tx, rx) = oneshot::channel::<()>();
        let slot = Mutex::new(Some(tx));
        emitter.on_async("ping", move |_| {
            let tx = slot.lock().unwrap().take();
            Box::pin(async move {
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
                Err::<(), ListenerError>("listener failure".into())
            })
        });
        emitter.emit("ping", &ping());
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("async listener never ran")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_resolves_on_matching_emission() {
        let emitter = Arc::new(EventEmitter::new());
        let em = emitter.clone();
        let waiter = tokio::spawn(async move {
            em.wait_for(
                "pong",
                |e| matches!(e, Event::Pong { latency } if latency.as_millis() > 5),
                Duration::from_secs(1),
            )
            .await
        });
        tokio::task::yield_now().await;
        // Non-matching emission is ignored by the predicate.
        emitter.emit(
            "pong",
            &Event::Pong {
                latency: Duration::from_millis(1),
            },
        );
        emitter.emit(
            "pong",
            &Event::Pong {
                latency: Duration::from_millis(10),
            },
        );
        let event = waiter.await.unwrap().unwrap();
        assert!(matches!(event, Event::Pong { .. }));
        assert_eq!(emitter.listener_count("pong"), 0);
    }

    #[tokio::test]
    async fn wait_for_times_out_and_removes_listener() {
        let emitter = EventEmitter::new();
        let result = emitter
            .wait_for("ping", |_| true, Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(emitter.listener_count("ping"), 0);
    }

    #[tokio::test]
    async fn emit_many_preserves_order() {
        let emitter = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        emitter.on("chat", move |_| o.lock().unwrap().push("chat"));
        let o = order.clone();
        emitter.on("message", move |_| o.lock().unwrap().push("message"));
        emitter.emit_many(&["chat", "message"], &ping());
        assert_eq!(*order.lock().unwrap(), vec!["chat", "message"]);
    }
}
