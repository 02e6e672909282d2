//! Update feed for observing commits.
//!
//! One [`UpdateEvent`] is published per committed revision, after the
//! committed values are visible in every item chain. The feed delivers it
//!
//! - synchronously to registered [`UpdateListener`]s, together with the
//!   committed values (this is how association and query caches fold
//!   commits in),
//! - to channel subscribers,
//! - into a bounded history for [`UpdateFeed::poll`].
//!
//! Listeners are owned registrations: whoever subscribes keeps the
//! [`SubscriptionId`] and calls [`UpdateFeed::unsubscribe`] on teardown.
//!
//! # Usage
//!
//! ```rust,ignore
//! let receiver = kb.feed().channel();
//! std::thread::spawn(move || {
//!     while let Ok(event) = receiver.recv() {
//!         println!("r{}: {} created", event.revision, event.created.len());
//!     }
//! });
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::RwLock;
use revkb_codec::{ObjectKey, RevisionNumber, Value};
use serde::Serialize;

use crate::item::KnowledgeItem;

/// Objects touched by one committed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateEvent {
    /// The committed revision.
    pub revision: RevisionNumber,
    /// Who committed it.
    pub author: String,
    /// Newly created objects.
    pub created: Vec<ObjectKey>,
    /// Changed objects.
    pub updated: Vec<ObjectKey>,
    /// Deleted objects.
    pub deleted: Vec<ObjectKey>,
}

impl UpdateEvent {
    /// Number of touched objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// Returns true if no object was touched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `key` was touched.
    #[must_use]
    pub fn touches(&self, key: &ObjectKey) -> bool {
        self.created.contains(key) || self.updated.contains(key) || self.deleted.contains(key)
    }
}

/// One object's committed change.
#[derive(Debug, Clone)]
pub struct CommittedChange {
    /// The item.
    pub item: Arc<KnowledgeItem>,
    /// Column values before the commit; `None` if the object did not exist.
    pub before: Option<Arc<[Value]>>,
    /// Column values after the commit; `None` if the object was deleted.
    pub after: Option<Arc<[Value]>>,
}

impl CommittedChange {
    /// Key of the changed item.
    #[must_use]
    pub fn key(&self) -> &ObjectKey {
        self.item.key()
    }
}

/// What listeners receive: the event plus the committed values.
#[derive(Debug, Clone, Copy)]
pub struct CommitNotice<'a> {
    /// The published event.
    pub event: &'a UpdateEvent,
    /// Per-object changes.
    pub changes: &'a [CommittedChange],
}

/// Receives commits synchronously while the committed state is published.
///
/// Implementations must not block on knowledge base locks.
pub trait UpdateListener: Send + Sync + fmt::Debug {
    /// Called once per committed revision, in revision order.
    fn on_commit(&self, notice: &CommitNotice<'_>);
}

/// Handle of a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Distributes committed revisions to listeners, channels and history.
pub struct UpdateFeed {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn UpdateListener>)>>,
    channels: RwLock<Vec<Sender<UpdateEvent>>>,
    history: RwLock<VecDeque<UpdateEvent>>,
    max_history: usize,
    next_subscription: AtomicU64,
}

impl fmt::Debug for UpdateFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateFeed")
            .field("listeners", &self.listener_count())
            .field("channels", &self.channel_count())
            .field("history", &self.history_len())
            .finish()
    }
}

impl UpdateFeed {
    /// Creates a feed keeping at most `max_history` events for polling.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            channels: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Registers a listener.
    pub fn subscribe(&self, listener: Arc<dyn UpdateListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    /// Opens a channel receiving all future events.
    ///
    /// The receiver should be drained regularly; dropping it unregisters
    /// the channel on the next publish.
    pub fn channel(&self) -> Receiver<UpdateEvent> {
        let (tx, rx) = mpsc::channel();
        self.channels.write().push(tx);
        rx
    }

    /// Publishes one committed revision.
    pub(crate) fn publish(&self, notice: &CommitNotice<'_>) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_commit(notice);
        }

        {
            let mut history = self.history.write();
            history.push_back(notice.event.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        let mut channels = self.channels.write();
        channels.retain(|tx| tx.send(notice.event.clone()).is_ok());
    }

    /// Events with revision > `after`, oldest first, up to `limit`.
    pub fn poll(&self, after: RevisionNumber, limit: usize) -> Vec<UpdateEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.revision > after)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Revision of the newest event in history, or 0.
    pub fn latest_revision(&self) -> RevisionNumber {
        self.history.read().back().map_or(0, |e| e.revision)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Number of events in history.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Drops history events older than `min_revision`.
    pub fn truncate_history(&self, min_revision: RevisionNumber) {
        self.history.write().retain(|e| e.revision >= min_revision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use revkb_codec::TRUNK;
    use std::thread;
    use std::time::Duration;

    fn event(revision: RevisionNumber) -> UpdateEvent {
        UpdateEvent {
            revision,
            author: "tester".into(),
            created: vec![ObjectKey::current(TRUNK, "Person", revision)],
            updated: vec![],
            deleted: vec![],
        }
    }

    fn publish(feed: &UpdateFeed, revision: RevisionNumber) {
        let event = event(revision);
        feed.publish(&CommitNotice {
            event: &event,
            changes: &[],
        });
    }

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<RevisionNumber>>,
    }

    impl UpdateListener for Recorder {
        fn on_commit(&self, notice: &CommitNotice<'_>) {
            self.seen.lock().push(notice.event.revision);
        }
    }

    #[test]
    fn listeners_see_commits_until_unsubscribed() {
        let feed = UpdateFeed::with_max_history(16);
        let recorder = Arc::new(Recorder::default());
        let id = feed.subscribe(recorder.clone());

        publish(&feed, 1);
        publish(&feed, 2);
        assert!(feed.unsubscribe(id));
        assert!(!feed.unsubscribe(id));
        publish(&feed, 3);

        assert_eq!(*recorder.seen.lock(), vec![1, 2]);
        assert_eq!(feed.listener_count(), 0);
    }

    #[test]
    fn channel_receives_and_is_dropped_when_closed() {
        let feed = UpdateFeed::with_max_history(16);
        let rx = feed.channel();
        publish(&feed, 1);
        assert_eq!(rx.recv().unwrap().revision, 1);

        drop(rx);
        publish(&feed, 2);
        assert_eq!(feed.channel_count(), 0);
    }

    #[test]
    fn poll_after_revision_with_limit() {
        let feed = UpdateFeed::with_max_history(16);
        for r in 1..=5 {
            publish(&feed, r);
        }
        let events = feed.poll(2, 2);
        assert_eq!(
            events.iter().map(|e| e.revision).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert_eq!(feed.latest_revision(), 5);
    }

    #[test]
    fn history_is_bounded() {
        let feed = UpdateFeed::with_max_history(3);
        for r in 1..=10 {
            publish(&feed, r);
        }
        assert_eq!(feed.history_len(), 3);
        assert_eq!(feed.poll(0, 100)[0].revision, 8);

        feed.truncate_history(10);
        assert_eq!(feed.history_len(), 1);
    }

    #[test]
    fn threaded_channel() {
        let feed = Arc::new(UpdateFeed::with_max_history(16));
        let rx = feed.channel();

        let feed_clone = Arc::clone(&feed);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            publish(&feed_clone, 7);
        });

        let received = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert!(received.touches(&ObjectKey::current(TRUNK, "Person", 7)));
        handle.join().unwrap();
    }
}
