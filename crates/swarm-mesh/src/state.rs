//! Replicated key-value store with last-writer-wins merge.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use swarm_core::NodeId;
use tracing::{debug, warn};

use crate::protocol::StateUpdate;

/// Watcher key that subscribes to every change.
pub const WILDCARD: &str = "*";

/// A stored value together with its replication metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub value: String,
    pub version: u32,
    pub origin: NodeId,
    pub timestamp: Instant,
}

/// A change delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub key: String,
    pub value: String,
    /// Empty when the key was not present before.
    pub old_value: String,
    pub origin: NodeId,
}

/// Writes requested by watchers or loop hooks.
///
/// The node drains the queue through its local write path before the current
/// step finishes, in the order the writes were queued.
#[derive(Debug, Default)]
pub struct WriteQueue {
    pending: VecDeque<(String, String)>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pending.push_back((key.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn pop(&mut self) -> Option<(String, String)> {
        self.pending.pop_front()
    }

    pub(crate) fn append(&mut self, other: &mut WriteQueue) {
        self.pending.append(&mut other.pending);
    }
}

/// State change observer.
pub type Watcher = Box<dyn FnMut(&StateChange, &mut WriteQueue) + Send>;

/// Outcome of applying a remote update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Update stored. `changed` is false when the value stayed the same and
    /// only version/origin bookkeeping moved.
    Accepted { changed: bool },
    Rejected,
}

/// Whether an incoming `(version, origin)` beats the stored one.
///
/// Higher version wins; on equal versions the lower origin wins.
pub fn merge_wins(existing: Option<&StateEntry>, version: u32, origin: NodeId) -> bool {
    match existing {
        None => true,
        Some(entry) => {
            version > entry.version || (version == entry.version && origin < entry.origin)
        }
    }
}

/// Local replica of the shared key-value state.
#[derive(Default)]
pub struct StateStore {
    entries: BTreeMap<String, StateEntry>,
    watchers: HashMap<String, Vec<Watcher>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a local write. Returns the update to broadcast, or `None` when
    /// the value is unchanged, the key is not storable, or the stored version
    /// is already at its maximum.
    pub fn write_local(
        &mut self,
        key: &str,
        value: &str,
        local_id: NodeId,
        queue: &mut WriteQueue,
    ) -> Option<StateUpdate> {
        if !storable(key) {
            warn!(key = %key, "refusing to store reserved or empty key");
            return None;
        }

        let (version, old_value) = match self.entries.get(key) {
            Some(entry) if entry.value == value => return None,
            Some(entry) => match entry.version.checked_add(1) {
                Some(next) => (next, entry.value.clone()),
                None => {
                    warn!(
                        key = %key,
                        origin = %format!("{:08x}", entry.origin),
                        "version space exhausted, refusing local write"
                    );
                    return None;
                }
            },
            None => (1, String::new()),
        };

        self.entries.insert(
            key.to_string(),
            StateEntry {
                value: value.to_string(),
                version,
                origin: local_id,
                timestamp: Instant::now(),
            },
        );

        let change = StateChange {
            key: key.to_string(),
            value: value.to_string(),
            old_value,
            origin: local_id,
        };
        self.notify(&change, queue);

        Some(StateUpdate::new(key, value, version, local_id))
    }

    /// Merge an update received from the mesh.
    pub fn apply_remote(&mut self, update: &StateUpdate, queue: &mut WriteQueue) -> MergeOutcome {
        if !storable(&update.key) {
            debug!(key = %update.key, "dropping remote update for reserved key");
            return MergeOutcome::Rejected;
        }

        let existing = self.entries.get(&update.key);
        if !merge_wins(existing, update.version, update.origin) {
            return MergeOutcome::Rejected;
        }

        let old_value = existing.map(|e| e.value.clone()).unwrap_or_default();
        let changed = existing.is_none_or(|e| e.value != update.value);

        self.entries.insert(
            update.key.clone(),
            StateEntry {
                value: update.value.clone(),
                version: update.version,
                origin: update.origin,
                timestamp: Instant::now(),
            },
        );

        if changed {
            let change = StateChange {
                key: update.key.clone(),
                value: update.value.clone(),
                old_value,
                origin: update.origin,
            };
            self.notify(&change, queue);
        }

        MergeOutcome::Accepted { changed }
    }

    pub fn get(&self, key: &str) -> Option<&StateEntry> {
        self.entries.get(key)
    }

    pub fn value_or(&self, key: &str, default: &str) -> String {
        self.entries
            .get(key)
            .map(|e| e.value.clone())
            .unwrap_or_else(|| default.to_string())
    }

    /// Register a watcher for a key or for [`WILDCARD`].
    pub fn watch(&mut self, key: impl Into<String>, watcher: Watcher) {
        self.watchers.entry(key.into()).or_default().push(watcher);
    }

    /// Every entry as a wire update, in key order.
    pub fn snapshot(&self) -> Vec<StateUpdate> {
        self.entries
            .iter()
            .map(|(k, e)| StateUpdate::new(k.clone(), e.value.clone(), e.version, e.origin))
            .collect()
    }

    /// Plain key/value view, in key order.
    pub fn values(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn notify(&mut self, change: &StateChange, queue: &mut WriteQueue) {
        if let Some(list) = self.watchers.get_mut(&change.key) {
            for watcher in list.iter_mut() {
                watcher(change, queue);
            }
        }
        if let Some(list) = self.watchers.get_mut(WILDCARD) {
            for watcher in list.iter_mut() {
                watcher(change, queue);
            }
        }
    }
}

fn storable(key: &str) -> bool {
    !key.is_empty() && key != WILDCARD
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> Watcher {
        let log = log.clone();
        Box::new(move |c: &StateChange, _q: &mut WriteQueue| {
            log.lock()
                .unwrap()
                .push(format!("{tag}:{}={}<-{}", c.key, c.value, c.old_value));
        })
    }

    #[test]
    fn test_local_write_versions_increase_by_one() {
        let mut store = StateStore::new();
        let mut q = WriteQueue::new();
        let a = store.write_local("led", "1", 10, &mut q).unwrap();
        let b = store.write_local("led", "0", 10, &mut q).unwrap();
        let c = store.write_local("led", "1", 10, &mut q).unwrap();
        assert_eq!((a.version, b.version, c.version), (1, 2, 3));
        assert_eq!(c.origin, 10);
    }

    #[test]
    fn test_local_write_same_value_is_noop() {
        let mut store = StateStore::new();
        let mut q = WriteQueue::new();
        store.write_local("led", "1", 10, &mut q).unwrap();
        assert!(store.write_local("led", "1", 10, &mut q).is_none());
        assert_eq!(store.get("led").unwrap().version, 1);
    }

    #[test]
    fn test_wildcard_key_is_not_storable() {
        let mut store = StateStore::new();
        let mut q = WriteQueue::new();
        assert!(store.write_local(WILDCARD, "x", 1, &mut q).is_none());
        assert_eq!(
            store.apply_remote(&StateUpdate::new(WILDCARD, "x", 5, 1), &mut q),
            MergeOutcome::Rejected
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_apply_same_update_twice_is_idempotent() {
        let log: Log = Default::default();
        let mut store = StateStore::new();
        store.watch("k", recorder(&log, "k"));
        let mut q = WriteQueue::new();
        let update = StateUpdate::new("k", "v", 3, 4);

        assert_eq!(
            store.apply_remote(&update, &mut q),
            MergeOutcome::Accepted { changed: true }
        );
        assert_eq!(store.apply_remote(&update, &mut q), MergeOutcome::Rejected);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(store.get("k").unwrap().version, 3);
    }

    /// Every ordering of `items`, built by repeated insertion.
    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        match items.split_first() {
            None => vec![Vec::new()],
            Some((head, rest)) => {
                let mut out = Vec::new();
                for perm in permutations(rest) {
                    for i in 0..=perm.len() {
                        let mut p = perm.clone();
                        p.insert(i, head.clone());
                        out.push(p);
                    }
                }
                out
            }
        }
    }

    #[test]
    fn test_reordered_updates_converge() {
        let updates = [
            StateUpdate::new("x", "a", 1, 9),
            StateUpdate::new("x", "b", 2, 7),
            StateUpdate::new("x", "c", 2, 3),
            StateUpdate::new("x", "d", 1, 1),
            StateUpdate::new("y", "z", 1, 1),
        ];
        let orders = permutations(&updates);
        assert_eq!(orders.len(), 120);

        let mut q = WriteQueue::new();
        let mut reference: Option<Vec<StateUpdate>> = None;
        for order in &orders {
            let mut store = StateStore::new();
            for u in order {
                store.apply_remote(u, &mut q);
            }
            let x = store.get("x").unwrap();
            assert_eq!((x.value.as_str(), x.version, x.origin), ("c", 2, 3));
            let snapshot = store.snapshot();
            match &reference {
                Some(r) => assert_eq!(&snapshot, r),
                None => reference = Some(snapshot),
            }
        }
    }

    #[test]
    fn test_local_write_refused_at_max_version() {
        let mut store = StateStore::new();
        let mut q = WriteQueue::new();
        store.apply_remote(&StateUpdate::new("k", "remote", u32::MAX, 50), &mut q);

        assert!(store.write_local("k", "local", 10, &mut q).is_none());
        let entry = store.get("k").unwrap();
        assert_eq!(entry.value, "remote");
        assert_eq!(entry.version, u32::MAX);
        assert_eq!(entry.origin, 50);
    }

    #[test]
    fn test_equal_value_update_does_not_notify() {
        let log: Log = Default::default();
        let mut store = StateStore::new();
        let mut q = WriteQueue::new();
        store.apply_remote(&StateUpdate::new("k", "same", 1, 9), &mut q);
        store.watch(WILDCARD, recorder(&log, "*"));

        let outcome = store.apply_remote(&StateUpdate::new("k", "same", 2, 9), &mut q);
        assert_eq!(outcome, MergeOutcome::Accepted { changed: false });
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(store.get("k").unwrap().version, 2);
    }

    #[test]
    fn test_lower_version_rejected() {
        let mut store = StateStore::new();
        let mut q = WriteQueue::new();
        store.apply_remote(&StateUpdate::new("k", "new", 5, 2), &mut q);
        assert_eq!(
            store.apply_remote(&StateUpdate::new("k", "old", 4, 1), &mut q),
            MergeOutcome::Rejected
        );
        assert_eq!(store.get("k").unwrap().value, "new");
    }

    #[test]
    fn test_specific_watcher_fires_before_wildcard() {
        let log: Log = Default::default();
        let mut store = StateStore::new();
        store.watch(WILDCARD, recorder(&log, "*"));
        store.watch("temp", recorder(&log, "temp"));
        let mut q = WriteQueue::new();
        store.write_local("temp", "5", 1, &mut q);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["temp:temp=5<-".to_string(), "*:temp=5<-".to_string()]
        );
    }

    #[test]
    fn test_tie_break_updates_origin_without_notifying() {
        let log: Log = Default::default();
        let mut store = StateStore::new();
        let mut q = WriteQueue::new();
        store.write_local("x", "a", 10, &mut q);
        store.watch("x", recorder(&log, "x"));

        let outcome = store.apply_remote(&StateUpdate::new("x", "a", 1, 5), &mut q);
        assert_eq!(outcome, MergeOutcome::Accepted { changed: false });
        assert_eq!(store.get("x").unwrap().origin, 5);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_watcher_writes_are_queued() {
        let mut store = StateStore::new();
        store.watch(
            "motion",
            Box::new(|c: &StateChange, q: &mut WriteQueue| {
                if c.value == "1" {
                    q.set("led", "1");
                }
            }),
        );
        let mut q = WriteQueue::new();
        store.write_local("motion", "1", 1, &mut q);
        assert_eq!(q.pop(), Some(("led".to_string(), "1".to_string())));
        assert!(store.get("led").is_none());
    }
}
