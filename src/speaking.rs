//! Speaking-state fan-out
//!
//! The stream manager publishes edges of the derived "agent is speaking"
//! signal here; any number of observers (animation driver, debug panel,
//! tests) subscribe independently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::trace;

pub type SpeakingCallback = Arc<dyn Fn(bool) + Send + Sync>;

type Subscribers = Mutex<Vec<(u64, SpeakingCallback)>>;

fn lock(subscribers: &Subscribers) -> MutexGuard<'_, Vec<(u64, SpeakingCallback)>> {
    subscribers.lock().unwrap_or_else(|e| e.into_inner())
}

/// Synchronous publish/subscribe channel for the speaking signal.
///
/// Delivery happens on the publishing thread, in registration order.
/// Values are not deduplicated: every publish reaches every subscriber.
#[derive(Clone, Default)]
pub struct SpeakingStateBroadcaster {
    subscribers: Arc<Subscribers>,
    next_id: Arc<AtomicU64>,
}

impl SpeakingStateBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push((id, Arc::new(callback)));
        trace!(subscriber = id, "Speaking state subscriber added");

        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn publish(&self, speaking: bool) {
        // Callbacks may subscribe or unsubscribe, so none run under the lock
        let snapshot: Vec<SpeakingCallback> = lock(&self.subscribers)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in snapshot {
            callback(speaking);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl std::fmt::Debug for SpeakingStateBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeakingStateBroadcaster")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`SpeakingStateBroadcaster::subscribe`].
///
/// Dropping it keeps the callback registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    /// Removes the callback. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock(&subscribers).retain(|(id, _)| *id != self.id);
        }
    }
}
