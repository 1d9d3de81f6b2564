//! Subscriber registry and the events delivered to it

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::StreamError;
use crate::protocol::SnapshotResponse;

/// Delivered to every subscriber
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A batch of decoded messages from the main stream
    Messages(Arc<Vec<Value>>),
    /// Rows fetched by `request_snapshot`
    Snapshot(Arc<SnapshotResponse>),
    /// The server rotated the shape; previously received rows are invalid
    MustRefetch,
    /// Terminal failure. The stream is stopped when this is delivered.
    Error(Arc<StreamError>),
}

type Callback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback)>>,
}

impl Subscribers {
    /// Register a callback. Returns its id and whether it is the only one.
    pub fn add(&self, callback: Callback) -> (u64, bool) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock();
        entries.push((id, callback));
        (id, entries.len() == 1)
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Call every subscriber outside the registry lock, so callbacks may
    /// subscribe or unsubscribe
    pub fn emit(&self, event: &StreamEvent) {
        let callbacks: Vec<Callback> = self
            .entries
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

/// Handle returned by `ShapeStream::subscribe`
///
/// Dropping it keeps the subscription; call [`Subscription::unsubscribe`].
#[must_use = "the subscription can only be removed through this handle"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    pub(crate) fn new(id: u64, subscribers: &Arc<Subscribers>) -> Self {
        Self {
            id,
            subscribers: Arc::downgrade(subscribers),
        }
    }

    /// Remove this subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        self.subscribers
            .upgrade()
            .is_some_and(|subscribers| subscribers.remove(self.id))
    }
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let callback: Callback = Arc::new(move |_: &StreamEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn test_first_subscriber_flag() {
        let subscribers = Subscribers::default();
        let (_, a) = counter();
        let (_, b) = counter();
        let (id_a, first) = subscribers.add(a);
        assert!(first);
        let (_, first) = subscribers.add(b);
        assert!(!first);

        assert!(subscribers.remove(id_a));
        assert!(!subscribers.remove(id_a));
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn test_emit_reaches_everyone() {
        let subscribers = Subscribers::default();
        let (count_a, a) = counter();
        let (count_b, b) = counter();
        subscribers.add(a);
        subscribers.add(b);

        subscribers.emit(&StreamEvent::MustRefetch);
        subscribers.emit(&StreamEvent::Messages(Arc::new(vec![])));

        assert_eq!(count_a.load(Ordering::SeqCst), 2);
        assert_eq!(count_b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_can_unsubscribe_itself() {
        let subscribers = Arc::new(Subscribers::default());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let handle = slot.clone();
        let (id, _) = subscribers.add(Arc::new(move |_: &StreamEvent| {
            if let Some(sub) = handle.lock().as_ref() {
                sub.unsubscribe();
            }
        }));
        *slot.lock() = Some(Subscription::new(id, &subscribers));

        subscribers.emit(&StreamEvent::MustRefetch);
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped() {
        let subscribers = Arc::new(Subscribers::default());
        let (_, cb) = counter();
        let (id, _) = subscribers.add(cb);
        let sub = Subscription::new(id, &subscribers);
        drop(subscribers);
        assert!(!sub.unsubscribe());
    }
}
