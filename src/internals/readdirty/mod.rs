//! The read/dirty controller.
//!
//! This is the amortisation scheme that makes the ordered map concurrently
//! readable. One immutable *committed* tree is published through an atomic
//! pointer and consulted lock free by every operation's fast path. A second
//! *dirty* tree, guarded by a coarse mutex, absorbs keys the committed tree
//! does not know about. Each lookup that has to fall through to the dirty
//! tree counts as a miss; once the misses outnumber the dirty tree's size,
//! the dirty tree is promoted wholesale to become the new committed
//! snapshot. The rebuild cost is thereby paid roughly once per *n* misses.
//!
//! Superseded snapshots are reclaimed with crossbeam's epoch collector, the
//! same way [`EbrCell`]-style cells retire their previous generations: the
//! pointer is swapped out and the old allocation is deferred for destruction
//! once no pinned reader can still observe it.
//!
//! [`EbrCell`]: https://docs.rs/concread/latest/concread/ebrcell/

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::CachePadded;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::{Arc, Mutex};
use tracing::trace;

use super::rbtree::{CmpFn, Entry, Node, RbTree};

/// The published, immutable pairing of a committed tree and its amended
/// flag. `amended` means the dirty tree holds keys this tree does not.
struct Snapshot<K, V> {
    tree: Arc<RbTree<K, V>>,
    amended: bool,
}

/// Everything the coarse lock protects: the dirty tree and the miss count.
///
/// Invariant: `dirty` is `Some` exactly while the published snapshot is
/// amended.
struct DirtyState<K, V> {
    dirty: Option<RbTree<K, V>>,
    misses: usize,
}

/// A concurrently readable ordered map core.
///
/// Reads resolve against the committed snapshot without locking whenever the
/// snapshot can answer authoritatively; everything else takes the coarse
/// lock, probes the dirty tree, and performs the promotion housekeeping.
pub struct ReadDirty<K, V> {
    read: CachePadded<Atomic<Snapshot<K, V>>>,
    state: Mutex<DirtyState<K, V>>,
    len: AtomicUsize,
}

impl<K, V> ReadDirty<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty map core ordered by `cmp`.
    pub fn new(cmp: Arc<CmpFn<K>>) -> Self {
        ReadDirty {
            read: CachePadded::new(Atomic::new(Snapshot {
                tree: Arc::new(RbTree::new(cmp)),
                amended: false,
            })),
            state: Mutex::new(DirtyState {
                dirty: None,
                misses: 0,
            }),
            len: AtomicUsize::new(0),
        }
    }

    fn read_snapshot<'g>(&self, guard: &'g Guard) -> &'g Snapshot<K, V> {
        // The pointer is initialised at construction and only ever replaced
        // with another live snapshot, so it is never null.
        unsafe { self.read.load(Acquire, guard).deref() }
    }

    fn publish(&self, snapshot: Snapshot<K, V>, guard: &Guard) {
        let old = self.read.swap(Owned::new(snapshot), AcqRel, guard);
        unsafe { guard.defer_destroy(old) };
    }

    /// Record a slow-path miss; promote the dirty tree once misses catch up
    /// with its size. Lock held.
    fn miss_locked(&self, state: &mut DirtyState<K, V>, guard: &Guard) {
        state.misses += 1;
        if state.misses < state.dirty.as_ref().map_or(0, RbTree::len) {
            return;
        }
        if let Some(dirty) = state.dirty.take() {
            trace!(
                "promoting dirty tree ({} entries) after {} misses",
                dirty.len(),
                state.misses
            );
            self.publish(
                Snapshot {
                    tree: Arc::new(dirty),
                    amended: false,
                },
                guard,
            );
        }
        state.misses = 0;
    }

    /// Seed the dirty tree from the committed snapshot. Lock held.
    ///
    /// Every committed entry is either swept (absent cells become expunged
    /// and stay behind) or linked into the dirty tree by sharing its cell.
    fn dirty_locked(&self, state: &mut DirtyState<K, V>, guard: &Guard) {
        if state.dirty.is_some() {
            return;
        }
        let read = self.read_snapshot(guard);
        trace!(
            "seeding dirty tree from snapshot ({} committed entries)",
            read.tree.len()
        );
        let mut dirty = RbTree::new(read.tree.comparator().clone());
        for node in read.tree.iter() {
            if !node.entry().try_expunge_locked(guard) {
                dirty.insert(node.key().clone(), node.entry_arc());
            }
        }
        state.dirty = Some(dirty);
    }

    /// Number of live (present) entries.
    pub fn len(&self) -> usize {
        self.len.load(Relaxed)
    }

    /// True when no live entries exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the value stored for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let guard = epoch::pin();
        let read = self.read_snapshot(&guard);
        let mut entry = read.tree.get(key).map(Node::entry_arc);
        if entry.is_none() && read.amended {
            let mut state = self.state.lock().unwrap();
            // Reload: a promotion may have raced us to the lock.
            let read = self.read_snapshot(&guard);
            entry = read.tree.get(key).map(Node::entry_arc);
            if entry.is_none() && read.amended {
                entry = state
                    .dirty
                    .as_ref()
                    .and_then(|dirty| dirty.get(key))
                    .map(Node::entry_arc);
                self.miss_locked(&mut state, &guard);
            }
        }
        entry.and_then(|e| e.load(&guard).cloned())
    }

    /// True when `key` holds a live value.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Store `value` under `key`, returning the previous value if the key
    /// was live.
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        let guard = epoch::pin();
        let read = self.read_snapshot(&guard);
        let mut value = value;
        if let Some(node) = read.tree.get(&key) {
            match node.entry().try_swap(value, &guard) {
                Ok(previous) => {
                    if previous.is_none() {
                        self.len.fetch_add(1, Relaxed);
                    }
                    return previous;
                }
                // Expunged: this entry left the dirty tree in a promotion
                // sweep, only the locked path may resurrect it.
                Err(v) => value = v,
            }
        }

        let mut state = self.state.lock().unwrap();
        let read = self.read_snapshot(&guard);
        let previous = if let Some(entry) = read.tree.get(&key).map(Node::entry_arc) {
            if entry.unexpunge_locked(&guard) {
                // The entry was swept; share its cell back into dirty so the
                // write survives the next promotion.
                if let Some(dirty) = state.dirty.as_mut() {
                    dirty.insert(key.clone(), entry.clone());
                }
            }
            entry.swap_locked(value, &guard)
        } else if let Some(entry) = state
            .dirty
            .as_ref()
            .and_then(|dirty| dirty.get(&key))
            .map(Node::entry_arc)
        {
            entry.swap_locked(value, &guard)
        } else {
            if !read.amended {
                // First write the snapshot cannot answer: build dirty and
                // republish the same tree marked amended.
                self.dirty_locked(&mut state, &guard);
                self.publish(
                    Snapshot {
                        tree: read.tree.clone(),
                        amended: true,
                    },
                    &guard,
                );
            }
            if let Some(dirty) = state.dirty.as_mut() {
                dirty.insert(key, Arc::new(Entry::new(value)));
            }
            self.len.fetch_add(1, Relaxed);
            return None;
        };
        if previous.is_none() {
            self.len.fetch_add(1, Relaxed);
        }
        previous
    }

    /// Return the live value for `key`, or store `value` and return that.
    /// The flag is true when an existing value was returned.
    pub fn get_or_insert(&self, key: K, value: V) -> (V, bool) {
        let guard = epoch::pin();
        let read = self.read_snapshot(&guard);
        let mut value = value;
        if let Some(node) = read.tree.get(&key) {
            match node.entry().try_load_or_store(value, &guard) {
                Ok((actual, loaded)) => {
                    if !loaded {
                        self.len.fetch_add(1, Relaxed);
                    }
                    return (actual, loaded);
                }
                Err(v) => value = v,
            }
        }

        let mut state = self.state.lock().unwrap();
        let read = self.read_snapshot(&guard);
        let (actual, loaded) = if let Some(entry) = read.tree.get(&key).map(Node::entry_arc) {
            if entry.unexpunge_locked(&guard) {
                if let Some(dirty) = state.dirty.as_mut() {
                    dirty.insert(key.clone(), entry.clone());
                }
            }
            match entry.try_load_or_store(value, &guard) {
                Ok(result) => result,
                // The cell was just unexpunged and the lock is held, so it
                // cannot re-enter the expunged state here.
                Err(_) => unreachable!("entry expunged while lock held"),
            }
        } else if let Some(entry) = state
            .dirty
            .as_ref()
            .and_then(|dirty| dirty.get(&key))
            .map(Node::entry_arc)
        {
            let result = match entry.try_load_or_store(value, &guard) {
                Ok(result) => result,
                Err(_) => unreachable!("dirty entry can never be expunged"),
            };
            self.miss_locked(&mut state, &guard);
            result
        } else {
            if !read.amended {
                self.dirty_locked(&mut state, &guard);
                self.publish(
                    Snapshot {
                        tree: read.tree.clone(),
                        amended: true,
                    },
                    &guard,
                );
            }
            let actual = value.clone();
            if let Some(dirty) = state.dirty.as_mut() {
                dirty.insert(key, Arc::new(Entry::new(value)));
            }
            (actual, false)
        };
        if !loaded {
            self.len.fetch_add(1, Relaxed);
        }
        (actual, loaded)
    }

    /// Delete `key`, returning the value it held.
    pub fn remove(&self, key: &K) -> Option<V> {
        let guard = epoch::pin();
        let read = self.read_snapshot(&guard);
        let mut entry = read.tree.get(key).map(Node::entry_arc);
        if entry.is_none() && read.amended {
            let mut state = self.state.lock().unwrap();
            let read = self.read_snapshot(&guard);
            entry = read.tree.get(key).map(Node::entry_arc);
            if entry.is_none() && read.amended {
                // Dirty-only keys are unlinked structurally as well as
                // tombstoned; the cell handle survives the unlink.
                entry = state.dirty.as_mut().and_then(|dirty| dirty.remove(key));
                self.miss_locked(&mut state, &guard);
            }
        }
        let value = entry.and_then(|e| e.delete(&guard));
        if value.is_some() {
            self.len.fetch_sub(1, Relaxed);
        }
        value
    }

    /// Replace the value under `key` with `new` only while the stored value
    /// equals `current`.
    pub fn compare_and_swap(&self, key: &K, current: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let guard = epoch::pin();
        let read = self.read_snapshot(&guard);
        if let Some(node) = read.tree.get(key) {
            return node.entry().try_compare_and_swap(current, new, &guard);
        } else if !read.amended {
            return false;
        }

        let mut state = self.state.lock().unwrap();
        let read = self.read_snapshot(&guard);
        let mut swapped = false;
        if let Some(node) = read.tree.get(key) {
            swapped = node.entry().try_compare_and_swap(current, new, &guard);
        } else if let Some(entry) = state
            .dirty
            .as_ref()
            .and_then(|dirty| dirty.get(key))
            .map(Node::entry_arc)
        {
            swapped = entry.try_compare_and_swap(current, new, &guard);
            self.miss_locked(&mut state, &guard);
        }
        swapped
    }

    /// Delete `key` only while the stored value equals `current`. The node
    /// is tombstoned in place; the next promotion sweep drops it.
    pub fn compare_and_remove(&self, key: &K, current: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = epoch::pin();
        let read = self.read_snapshot(&guard);
        let mut entry = read.tree.get(key).map(Node::entry_arc);
        if entry.is_none() && read.amended {
            let mut state = self.state.lock().unwrap();
            let read = self.read_snapshot(&guard);
            entry = read.tree.get(key).map(Node::entry_arc);
            if entry.is_none() && read.amended {
                entry = state
                    .dirty
                    .as_ref()
                    .and_then(|dirty| dirty.get(key))
                    .map(Node::entry_arc);
                self.miss_locked(&mut state, &guard);
            }
        }
        match entry {
            Some(e) if e.compare_and_delete(current, &guard) => {
                self.len.fetch_sub(1, Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Force an immediate promotion when the snapshot is amended, so that
    /// iteration observes one consistent tree. Returns a guard-borrowed
    /// reference to the authoritative snapshot.
    fn promoted_snapshot<'g>(&self, guard: &'g Guard) -> &'g Snapshot<K, V> {
        let read = self.read_snapshot(guard);
        if !read.amended {
            return read;
        }
        let mut state = self.state.lock().unwrap();
        let read = self.read_snapshot(guard);
        if read.amended {
            if let Some(dirty) = state.dirty.take() {
                trace!(
                    "forcing promotion before iteration ({} entries)",
                    dirty.len()
                );
                self.publish(
                    Snapshot {
                        tree: Arc::new(dirty),
                        amended: false,
                    },
                    guard,
                );
            }
            state.misses = 0;
        }
        self.read_snapshot(guard)
    }

    /// Visit every live pair in ascending key order. Returning false from
    /// the visitor stops the walk immediately.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let guard = epoch::pin();
        let read = self.promoted_snapshot(&guard);
        for node in read.tree.iter() {
            if let Some(value) = node.entry().load(&guard) {
                if !f(node.key(), value) {
                    break;
                }
            }
        }
    }

    /// An owned-pair iterator over the promoted snapshot. The iterator pins
    /// an epoch guard for its whole lifetime, keeping the snapshot alive.
    pub fn iter(&self) -> SnapshotIter<K, V> {
        let guard = epoch::pin();
        let first = {
            let read = self.promoted_snapshot(&guard);
            read.tree
                .first()
                .map_or(std::ptr::null(), |n| n as *const Node<K, V>)
        };
        SnapshotIter { guard, node: first }
    }
}

impl<K, V> Drop for ReadDirty<K, V> {
    fn drop(&mut self) {
        // Unlink the published snapshot so its tree is reclaimed with us.
        let guard = epoch::pin();
        let read = self.read.load(Acquire, &guard);
        unsafe { guard.defer_destroy(read) };
    }
}

/// Owned-pair iterator over a committed snapshot, in ascending key order.
/// Tombstoned entries are skipped.
pub struct SnapshotIter<K, V> {
    guard: Guard,
    node: *const Node<K, V>,
}

impl<K, V> Iterator for SnapshotIter<K, V>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        while let Some(node) = unsafe { self.node.as_ref() } {
            self.node = node.next().map_or(std::ptr::null(), |n| n as *const Node<K, V>);
            if let Some(value) = node.entry().load(&self.guard) {
                return Some((node.key().clone(), value.clone()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::ReadDirty;
    use std::sync::Arc;

    fn new_core() -> ReadDirty<u64, u64> {
        ReadDirty::new(Arc::new(|a: &u64, b: &u64| a.cmp(b)))
    }

    fn traversal_count(core: &ReadDirty<u64, u64>) -> usize {
        let mut count = 0;
        core.for_each(|_, _| {
            count += 1;
            true
        });
        count
    }

    #[test]
    fn test_core_basic_ops() {
        let core = new_core();
        assert!(core.is_empty());
        assert_eq!(core.swap(1, 10), None);
        assert_eq!(core.swap(1, 11), Some(10));
        assert_eq!(core.get(&1), Some(11));
        assert_eq!(core.len(), 1);
        assert_eq!(core.remove(&1), Some(11));
        assert_eq!(core.remove(&1), None);
        assert_eq!(core.get(&1), None);
        assert!(core.is_empty());
    }

    #[test]
    fn test_core_ordered_iteration() {
        let core = new_core();
        for k in [5, 1, 3, 2, 4] {
            core.swap(k, k * 100);
        }
        let pairs: Vec<(u64, u64)> = core.iter().collect();
        assert_eq!(
            pairs,
            vec![(1, 100), (2, 200), (3, 300), (4, 400), (5, 500)]
        );
    }

    #[test]
    fn test_core_for_each_stops() {
        let core = new_core();
        for k in 0..10 {
            core.swap(k, k);
        }
        let mut seen = vec![];
        core.for_each(|k, _| {
            seen.push(*k);
            *k < 3
        });
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_core_get_or_insert() {
        let core = new_core();
        assert_eq!(core.get_or_insert(7, 70), (70, false));
        assert_eq!(core.get_or_insert(7, 71), (70, true));
        assert_eq!(core.len(), 1);
    }

    #[test]
    fn test_core_compare_and_swap() {
        let core = new_core();
        core.swap(1, 10);
        assert!(!core.compare_and_swap(&1, &9, 20));
        assert_eq!(core.get(&1), Some(10));
        assert!(core.compare_and_swap(&1, &10, 20));
        assert_eq!(core.get(&1), Some(20));
        // Absent key: clean snapshot short-circuits, amended probes dirty.
        assert!(!core.compare_and_swap(&2, &0, 1));
    }

    #[test]
    fn test_core_compare_and_remove() {
        let core = new_core();
        core.swap(1, 10);
        assert!(!core.compare_and_remove(&1, &9));
        assert_eq!(core.get(&1), Some(10));
        assert!(core.compare_and_remove(&1, &10));
        assert_eq!(core.get(&1), None);
        assert_eq!(core.len(), 0);
        assert!(!core.compare_and_remove(&1, &10));
    }

    #[test]
    fn test_core_promotion_cycles_preserve_entries() {
        let core = new_core();
        // Repeated write-then-miss cycles drive A -> B -> A transitions.
        for round in 0..8_u64 {
            let base = round * 64;
            for k in base..base + 64 {
                core.swap(k, k);
            }
            // Reads of an always-missing key force miss accounting and,
            // eventually, promotion.
            for _ in 0..256 {
                assert_eq!(core.get(&u64::MAX), None);
            }
            assert_eq!(core.len(), ((round + 1) * 64) as usize);
            assert_eq!(traversal_count(&core), core.len());
        }
        // Everything written is still there, in order.
        let pairs: Vec<(u64, u64)> = core.iter().collect();
        assert_eq!(pairs.len(), 512);
        assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_core_expunge_resurrection() {
        let core = new_core();
        core.swap(1, 10);
        core.swap(2, 20);
        // Promote so both keys live in the committed snapshot.
        core.for_each(|_, _| true);
        // Tombstone key 1 through the fast path.
        assert_eq!(core.remove(&1), Some(10));
        // A write of a fresh key seeds dirty; the sweep expunges key 1.
        core.swap(3, 30);
        // Resurrecting key 1 must route through the locked unexpunge path.
        assert_eq!(core.swap(1, 11), None);
        assert_eq!(core.get(&1), Some(11));
        // After promotion the resurrected key is still visible.
        let pairs: Vec<(u64, u64)> = core.iter().collect();
        assert_eq!(pairs, vec![(1, 11), (2, 20), (3, 30)]);
        assert_eq!(core.len(), 3);
    }

    #[test]
    fn test_core_tombstone_dropped_by_sweep() {
        let core = new_core();
        core.swap(1, 10);
        core.swap(2, 20);
        core.for_each(|_, _| true);
        core.remove(&2);
        // Seed dirty: the sweep expunges the tombstone, promotion drops it.
        core.swap(3, 30);
        core.for_each(|_, _| true);
        let pairs: Vec<(u64, u64)> = core.iter().collect();
        assert_eq!(pairs, vec![(1, 10), (3, 30)]);
        assert_eq!(core.len(), 2);
    }

    #[test]
    fn test_core_len_tracks_traversal() {
        let core = new_core();
        for k in 0..128 {
            core.swap(k, k);
        }
        for k in (0..128).step_by(3) {
            core.remove(&k);
        }
        core.get_or_insert(500, 1);
        core.compare_and_remove(&500, &1);
        assert_eq!(core.len(), traversal_count(&core));
    }
}
