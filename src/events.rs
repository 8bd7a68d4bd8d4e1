/// Typed event dispatch.
///
/// `EventBus` is the in-process listener registry every stateful
/// component announces through; `EventStream` adapts a broadcast
/// receiver into a `Stream` for async consumers.

use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::error;

/// Event identity: a domain enum, never a free-form string.
pub trait EventKey: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> EventKey for T {}

/// Handle returned by `on`/`once`, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry<K, P> {
    id: ListenerId,
    /// `None` listens on every event.
    filter: Option<Vec<K>>,
    once: bool,
    listener: Arc<dyn Fn(&P) + Send + Sync>,
}

impl<K: EventKey, P> Entry<K, P> {
    fn matches(&self, name: K) -> bool {
        match &self.filter {
            None => true,
            Some(names) => names.contains(&name),
        }
    }
}

struct Registry<K, P> {
    next_id: u64,
    entries: Vec<Entry<K, P>>,
}

/// At-most-once ordered dispatch per listener.
///
/// `emit` iterates a snapshot of the registry, so a listener removing
/// itself or others mid-emit never corrupts iteration. Listener panics
/// are caught and logged; `emit_unsafe` propagates them instead.
pub struct EventBus<K: EventKey, P> {
    registry: Mutex<Registry<K, P>>,
}

impl<K: EventKey, P> Default for EventBus<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EventKey, P> EventBus<K, P> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }

    /// Register for the given event names; `None` means every event.
    pub fn on<F>(&self, names: Option<Vec<K>>, listener: F) -> ListenerId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.register(names, false, Arc::new(listener))
    }

    /// Register a listener removed after its first successful invocation.
    pub fn once<F>(&self, names: Option<Vec<K>>, listener: F) -> ListenerId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.register(names, true, Arc::new(listener))
    }

    fn register(
        &self,
        names: Option<Vec<K>>,
        once: bool,
        listener: Arc<dyn Fn(&P) + Send + Sync>,
    ) -> ListenerId {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry.entries.push(Entry {
            id,
            filter: names,
            once,
            listener,
        });
        id
    }

    /// Remove one listener by its handle.
    pub fn off(&self, id: ListenerId) {
        self.registry.lock().entries.retain(|entry| entry.id != id);
    }

    /// Remove every listener registered for `name` (wildcards stay).
    pub fn off_event(&self, name: K) {
        self.registry
            .lock()
            .entries
            .retain(|entry| !matches!(&entry.filter, Some(names) if names.contains(&name)));
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.registry.lock().entries.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().entries.len()
    }

    /// Dispatch `payload` to every matching listener, isolating panics.
    pub fn emit(&self, name: K, payload: &P) {
        self.dispatch(name, payload, false);
    }

    /// Dispatch without panic isolation: a listener panic propagates to
    /// the emitter. For internal wiring where a listener bug must not
    /// be swallowed.
    pub fn emit_unsafe(&self, name: K, payload: &P) {
        self.dispatch(name, payload, true);
    }

    fn dispatch(&self, name: K, payload: &P, propagate: bool) {
        // Snapshot under the lock, invoke outside it: listeners may call
        // back into on/off.
        let snapshot: Vec<(ListenerId, bool, Arc<dyn Fn(&P) + Send + Sync>)> = {
            let registry = self.registry.lock();
            registry
                .entries
                .iter()
                .filter(|entry| entry.matches(name))
                .map(|entry| (entry.id, entry.once, entry.listener.clone()))
                .collect()
        };

        for (id, once, listener) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(payload)));
            match outcome {
                Ok(()) => {
                    if once {
                        self.off(id);
                    }
                }
                Err(panic) => {
                    if propagate {
                        resume_unwind(panic);
                    }
                    error!("event listener panicked handling {:?}; continuing", name);
                }
            }
        }
    }
}

/// Broadcast receiver adapted to `Stream`, skipping lag gaps.
pub struct EventStream<T> {
    inner: BroadcastStream<T>,
}

impl<T: Clone + Send + 'static> EventStream<T> {
    pub fn new(receiver: broadcast::Receiver<T>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
        }
    }
}

impl<T: Clone + Send + 'static> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(item)),
                // A lagged receiver dropped events; resume with the next one.
                Poll::Ready(Some(Err(_))) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestEvent {
        Alpha,
        Beta,
    }

    #[test]
    fn filters_by_name_and_supports_wildcard() {
        let bus: EventBus<TestEvent, u32> = EventBus::new();
        let alpha_hits = Arc::new(AtomicUsize::new(0));
        let all_hits = Arc::new(AtomicUsize::new(0));

        let alpha_counter = alpha_hits.clone();
        bus.on(Some(vec![TestEvent::Alpha]), move |_| {
            alpha_counter.fetch_add(1, Ordering::SeqCst);
        });
        let all_counter = all_hits.clone();
        bus.on(None, move |_| {
            all_counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(TestEvent::Alpha, &1);
        bus.emit(TestEvent::Beta, &2);

        assert_eq!(alpha_hits.load(Ordering::SeqCst), 1);
        assert_eq!(all_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_listener_fires_exactly_once() {
        let bus: EventBus<TestEvent, u32> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        bus.once(Some(vec![TestEvent::Alpha]), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(TestEvent::Alpha, &1);
        bus.emit(TestEvent::Alpha, &1);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn listener_may_remove_itself_mid_emit() {
        let bus: Arc<EventBus<TestEvent, u32>> = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let id_slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let bus_ref = bus.clone();
        let slot_ref = id_slot.clone();
        let counter = hits.clone();
        let id = bus.on(None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot_ref.lock() {
                bus_ref.off(id);
            }
        });
        *id_slot.lock() = Some(id);

        bus.emit(TestEvent::Alpha, &1);
        bus.emit(TestEvent::Alpha, &1);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let bus: EventBus<TestEvent, u32> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.on(None, |_| panic!("listener bug"));
        let counter = hits.clone();
        bus.on(None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(TestEvent::Alpha, &1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "listener bug")]
    fn unsafe_emit_propagates() {
        let bus: EventBus<TestEvent, u32> = EventBus::new();
        bus.on(None, |_| panic!("listener bug"));
        bus.emit_unsafe(TestEvent::Alpha, &1);
    }

    #[test]
    fn off_event_keeps_wildcards() {
        let bus: EventBus<TestEvent, u32> = EventBus::new();
        bus.on(Some(vec![TestEvent::Alpha]), |_| {});
        bus.on(None, |_| {});

        bus.off_event(TestEvent::Alpha);
        assert_eq!(bus.listener_count(), 1);
    }
}
