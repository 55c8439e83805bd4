//! Change observers.
//!
//! Observers are fed synchronously after transaction commit, on the
//! thread that committed, so a subscriber always receives state that
//! already durably exists. Two flavors:
//!
//! - cold (`ChangeSubscription`): per-key deltas for committed writes,
//!   bulk writes, and merges;
//! - hot (`ReadSubscription`): the full matched set, re-queried after
//!   every commit that touches the matched region.
//!
//! Back-pressure: slow consumers drop. The data is in the store and
//! queryable; a lagged cold subscriber is disconnected, a lagged hot
//! subscriber just misses a snapshot the next commit supersedes.

use std::collections::BTreeMap;

use crossbeam::channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};

use crate::core::{EntryKey, Versions};
use crate::store::query::Filter;

const CHANNEL_CAPACITY: usize = 256;

/// One committed change to a slot, carrying the post-commit versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: EntryKey,
    pub versions: Versions,
}

/// The full matched set for a hot observer.
pub type ReadSnapshot = BTreeMap<EntryKey, Versions>;

/// Cold delta stream. A lagged or dropped subscription detaches from
/// the store silently.
pub struct ChangeSubscription {
    receiver: Receiver<ChangeEvent>,
}

impl ChangeSubscription {
    pub fn try_recv(&self) -> Result<ChangeEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv(&self) -> Result<ChangeEvent, crossbeam::channel::RecvError> {
        self.receiver.recv()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Hot snapshot stream.
pub struct ReadSubscription {
    receiver: Receiver<ReadSnapshot>,
}

impl ReadSubscription {
    pub fn try_recv(&self) -> Result<ReadSnapshot, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv(&self) -> Result<ReadSnapshot, crossbeam::channel::RecvError> {
        self.receiver.recv()
    }

    /// The most recent snapshot currently queued, discarding older
    /// ones.
    pub fn latest(&self) -> Option<ReadSnapshot> {
        let mut latest = None;
        while let Ok(snapshot) = self.receiver.try_recv() {
            latest = Some(snapshot);
        }
        latest
    }
}

#[derive(Debug)]
struct ColdEntry {
    sender: Sender<ChangeEvent>,
}

#[derive(Debug)]
struct HotEntry {
    sender: Sender<ReadSnapshot>,
    filter: Filter,
}

/// Subscriber registry, owned by the engine. Single producer (the
/// committing thread), multiple consumers.
#[derive(Default, Debug)]
pub(crate) struct Observers {
    cold: Vec<ColdEntry>,
    hot: Vec<HotEntry>,
}

impl Observers {
    pub fn subscribe_cold(&mut self) -> ChangeSubscription {
        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        self.cold.push(ColdEntry { sender });
        ChangeSubscription { receiver }
    }

    /// Register a hot observer. The current matched set is queued
    /// before the subscription is handed back, so the first `recv`
    /// always yields a snapshot.
    pub fn subscribe_hot(&mut self, filter: Filter, initial: ReadSnapshot) -> ReadSubscription {
        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        let _ = sender.try_send(initial);
        self.hot.push(HotEntry { sender, filter });
        ReadSubscription { receiver }
    }

    pub fn is_empty(&self) -> bool {
        self.cold.is_empty() && self.hot.is_empty()
    }

    /// Fan a committed delta out to cold subscribers. Lagged or
    /// disconnected subscribers are detached.
    pub fn publish_delta(&mut self, event: &ChangeEvent) {
        self.cold
            .retain(|entry| entry.sender.try_send(event.clone()).is_ok());
    }

    /// Hot filters matching at least one changed key (every filter
    /// when the whole store was touched), as `(token, filter)` pairs
    /// for the caller to re-query.
    pub fn hot_matches(&self, changed: &[EntryKey], touch_all: bool) -> Vec<(usize, Filter)> {
        self.hot
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                touch_all || changed.iter().any(|key| entry.filter.matches(key))
            })
            .map(|(idx, entry)| (idx, entry.filter.clone()))
            .collect()
    }

    /// Push a re-queried snapshot to one hot subscriber. A full queue
    /// drops the snapshot (the next commit supersedes it). Returns
    /// false when the receiving side went away; the caller detaches
    /// dead tokens afterwards so tokens stay valid across calls.
    pub fn publish_snapshot(&self, token: usize, snapshot: ReadSnapshot) -> bool {
        match self.hot.get(token) {
            Some(entry) => !matches!(
                entry.sender.try_send(snapshot),
                Err(TrySendError::Disconnected(_))
            ),
            None => false,
        }
    }

    /// Detach hot subscribers by token, highest first so earlier
    /// tokens stay valid while removing.
    pub fn detach_hot(&mut self, mut tokens: Vec<usize>) {
        tokens.sort_unstable();
        for token in tokens.into_iter().rev() {
            if token < self.hot.len() {
                self.hot.remove(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AuthorId, Value, Version};

    fn event(key: &str) -> ChangeEvent {
        ChangeEvent {
            key: EntryKey::unscoped(key),
            versions: Versions::new(vec![Version {
                author: AuthorId::generate(),
                timestamp: 1,
                value: Value::Text("v".into()),
            }]),
        }
    }

    #[test]
    fn cold_subscribers_receive_deltas() {
        let mut observers = Observers::default();
        let sub = observers.subscribe_cold();
        observers.publish_delta(&event("k"));
        let got = sub.try_recv().expect("delta queued");
        assert_eq!(got.key, EntryKey::unscoped("k"));
    }

    #[test]
    fn lagged_cold_subscriber_is_detached() {
        let mut observers = Observers::default();
        let sub = observers.subscribe_cold();
        for _ in 0..CHANNEL_CAPACITY {
            observers.publish_delta(&event("k"));
        }
        // Queue is full; the next publish drops the subscriber.
        observers.publish_delta(&event("k"));
        assert_eq!(sub.drain().len(), CHANNEL_CAPACITY);
        observers.publish_delta(&event("k"));
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn dropped_cold_subscriber_is_detached() {
        let mut observers = Observers::default();
        let sub = observers.subscribe_cold();
        drop(sub);
        observers.publish_delta(&event("k"));
        assert!(observers.cold.is_empty());
    }

    #[test]
    fn hot_matching_respects_filters() {
        let mut observers = Observers::default();
        let _sub = observers.subscribe_hot(Filter::default().in_scope("settings"), ReadSnapshot::new());

        let changed = [EntryKey::new("settings", "a"), EntryKey::new("data", "b")];
        assert_eq!(observers.hot_matches(&changed, false).len(), 1);

        let unrelated = [EntryKey::new("data", "b")];
        assert!(observers.hot_matches(&unrelated, false).is_empty());
        assert_eq!(observers.hot_matches(&unrelated, true).len(), 1);
    }

    #[test]
    fn full_hot_queue_drops_snapshot_not_subscriber() {
        let mut observers = Observers::default();
        let sub = observers.subscribe_hot(Filter::default(), ReadSnapshot::new());
        for _ in 0..(CHANNEL_CAPACITY + 4) {
            for (token, _) in observers.hot_matches(&[], true) {
                observers.publish_snapshot(token, ReadSnapshot::new());
            }
        }
        assert!(sub.latest().is_some());
        assert_eq!(observers.hot.len(), 1);
    }
}
