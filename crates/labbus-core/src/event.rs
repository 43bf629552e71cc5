/*!
 * Listener registries for LabBus.
 *
 * Controllers notify completion listeners and instruments notify status,
 * settings, reading and interrupt listeners through the same registry type.
 * Listeners are invoked synchronously on the notifying task, in registration
 * order.
 */
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::trace;

/// Maximum number of events buffered for each broadcast subscriber
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Handle returned when a listener is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A registered callback
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An ordered set of listeners for events of type `T`
pub struct ListenerSet<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    channel: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> ListenerSet<T> {
    /// Create an empty listener set
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            channel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener<T>)>> {
        // A panicking listener must not disable notification for everyone else.
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener
    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        trace!(%id, "Listener added");
        id
    }

    /// Unregister a listener; returns whether it was present
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if removed {
            trace!(%id, "Listener removed");
        }
        removed
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe through a broadcast channel instead of a callback
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.channel.subscribe()
    }

    /// Invoke every listener with `event`; returns how many were called
    pub fn notify(&self, event: &T) -> usize {
        let snapshot: Vec<Listener<T>> = self.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in &snapshot {
            listener(event);
        }
        if self.channel.receiver_count() > 0 {
            let _ = self.channel.send(event.clone());
        }
        snapshot.len()
    }
}

impl<T: Clone + Send + 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .listeners
            .lock()
            .map(|l| l.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len());
        f.debug_struct("ListenerSet").field("listeners", &count).finish()
    }
}
