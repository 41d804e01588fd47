//! In-process change notifications.
//!
//! The worker publishes a [`ChangeEvent`] after each committed status
//! change. Delivery is best-effort: nothing is persisted or replayed, and
//! a slow async subscriber that falls behind simply misses events.
//! Subscribers are expected to re-read the application, not to treat the
//! event stream as the source of truth.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt as _};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub entity_id: String,
}

pub type SubscriberId = u64;

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

pub struct ChangeNotifier {
    sender: Mutex<Option<broadcast::Sender<ChangeEvent>>>,
    callbacks: Mutex<BTreeMap<SubscriberId, Callback>>,
    next_id: AtomicU64,
}

// A poisoned lock only means a callback panicked mid-publish; the maps
// themselves are still consistent.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChangeNotifier {
    /// `capacity` bounds how far an async subscriber may lag before it
    /// starts missing events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
            callbacks: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Announce that `entity_id` changed. Returns how many subscribers
    /// (callbacks plus live receivers) the event reached.
    pub fn publish(&self, entity_id: &str) -> usize {
        let event = ChangeEvent {
            entity_id: entity_id.to_string(),
        };

        // Snapshot so a callback may register or unregister without deadlocking.
        let callbacks: Vec<Callback> = lock(&self.callbacks).values().cloned().collect();
        for callback in &callbacks {
            callback(&event);
        }

        let receivers = match lock(&self.sender).as_ref() {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        };
        debug!(entity_id, callbacks = callbacks.len(), receivers, "change published");
        callbacks.len() + receivers
    }

    /// Callbacks run synchronously on the publishing thread, in
    /// registration order.
    pub fn register<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.callbacks).insert(id, Arc::new(callback));
        id
    }

    pub fn unregister(&self, id: SubscriberId) -> bool {
        lock(&self.callbacks).remove(&id).is_some()
    }

    /// A raw receiver. After [`shutdown`](Self::shutdown) it reports
    /// `Closed` immediately.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        match lock(&self.sender).as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (_, rx) = broadcast::channel(1);
                rx
            }
        }
    }

    /// Event stream that skips over lag instead of failing.
    pub fn stream(&self) -> impl Stream<Item = ChangeEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|msg| msg.ok())
    }

    /// Drop every subscriber. Open receivers and streams end; later
    /// publishes reach nobody.
    pub fn shutdown(&self) {
        lock(&self.sender).take();
        lock(&self.callbacks).clear();
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_run_in_registration_order() {
        let notifier = ChangeNotifier::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            notifier.register(move |event| {
                seen.lock().unwrap().push(format!("{tag}:{}", event.entity_id));
            });
        }

        assert_eq!(notifier.publish("app-1"), 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:app-1", "second:app-1", "third:app-1"]
        );
    }

    #[test]
    fn unregistered_callback_stops_receiving() {
        let notifier = ChangeNotifier::new(8);
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let id = notifier.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        notifier.publish("app-1");
        assert!(notifier.unregister(id));
        assert!(!notifier.unregister(id));
        notifier.publish("app-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_without_subscribers_reaches_nobody() {
        let notifier = ChangeNotifier::new(8);
        assert_eq!(notifier.publish("app-1"), 0);
    }

    #[test]
    fn callback_may_unregister_itself() {
        let notifier = Arc::new(ChangeNotifier::new(8));
        let slot = Arc::new(AtomicU64::new(0));
        let (n, s) = (notifier.clone(), slot.clone());
        let id = notifier.register(move |_| {
            n.unregister(s.load(Ordering::SeqCst));
        });
        slot.store(id, Ordering::SeqCst);

        assert_eq!(notifier.publish("app-1"), 1);
        assert_eq!(notifier.publish("app-1"), 0);
    }

    #[tokio::test]
    async fn receivers_get_events_in_publish_order() {
        let notifier = ChangeNotifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.publish("a");
        notifier.publish("b");
        assert_eq!(rx.recv().await.unwrap().entity_id, "a");
        assert_eq!(rx.recv().await.unwrap().entity_id, "b");
    }

    #[tokio::test]
    async fn stream_skips_lag_and_ends_on_shutdown() {
        let notifier = ChangeNotifier::new(2);
        let stream = notifier.stream();
        for id in ["a", "b", "c", "d"] {
            notifier.publish(id);
        }
        notifier.shutdown();

        let ids: Vec<String> = stream.map(|e| e.entity_id).collect().await;
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[test]
    fn shutdown_drops_callbacks() {
        let notifier = ChangeNotifier::new(8);
        notifier.register(|_| {});
        notifier.shutdown();
        assert_eq!(notifier.publish("app-1"), 0);
    }
}
