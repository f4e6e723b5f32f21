//! Observer registry and event fan-out

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::PoolEvent;

/// Default number of events buffered for slow stream receivers
const STREAM_CAPACITY: usize = 1024;

/// Consumer of pool lifecycle events
///
/// Observers run synchronously on the thread that triggered the event, after
/// the pool has released its lock. Errors and panics are logged and dropped.
pub trait PoolObserver: Send + Sync {
    fn on_event(&self, event: &PoolEvent) -> anyhow::Result<()>;
}

impl<F> PoolObserver for F
where
    F: Fn(&PoolEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &PoolEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by `EventHub::subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fans out pool events to observers and a broadcast stream
pub struct EventHub {
    observers: RwLock<Vec<(SubscriptionId, Arc<dyn PoolObserver>)>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<PoolEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(STREAM_CAPACITY)
    }

    /// Create a hub whose stream buffers up to `capacity` events per receiver
    pub fn with_capacity(capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(capacity.max(1));
        Self {
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            stream,
        }
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn PoolObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Open a new event stream
    ///
    /// Receivers that fall more than the buffer capacity behind get
    /// `RecvError::Lagged` and skip ahead; the pool never waits on them.
    pub fn stream(&self) -> broadcast::Receiver<PoolEvent> {
        self.stream.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver an event to every observer and to stream receivers
    pub fn emit(&self, event: PoolEvent) {
        let observers: Vec<Arc<dyn PoolObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            match panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, kind = ?event.kind, slot_id = %event.slot_id, "pool observer failed");
                }
                Err(_) => {
                    tracing::warn!(kind = ?event.kind, slot_id = %event.slot_id, "pool observer panicked");
                }
            }
        }

        // No receivers is not an error for the pool.
        let _ = self.stream.send(event);
    }

    pub(crate) fn emit_all(&self, events: Vec<PoolEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("observers", &self.observer_count())
            .field("stream_receivers", &self.stream.receiver_count())
            .finish()
    }
}
