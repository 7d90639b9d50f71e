//! See the documentation for [OrderedMap].

use std::cmp::Ordering;
use std::fmt;
use std::fmt::Debug;
use std::iter::FromIterator;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crossbeam_epoch as epoch;

use crate::internals::rbtree::{CmpFn, Entry, RbTree};
use crate::internals::readdirty::{ReadDirty, SnapshotIter};

#[cfg(feature = "serde")]
use serde::{
    de::{Deserialize, Deserializer},
    ser::{Serialize, SerializeMap, Serializer},
};

#[cfg(feature = "serde")]
use crate::utils::MapCollector;

/// Which concurrency strategy a map is built with.
///
/// Both strategies present the identical operation set; the choice is made
/// once, at construction, and trades single-thread overhead against
/// read-side scalability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// The read/dirty protocol: reads resolve lock free against a committed
    /// snapshot, writes of unknown keys go through a lock-protected dirty
    /// tree that is periodically promoted. The default.
    #[default]
    ReadDirty,
    /// One tree behind one mutex, taken for the duration of every call.
    /// Cheaper per operation when contention is not a concern.
    Locked,
}

/// A concurrently readable map whose iteration order always follows key
/// order.
///
/// This structure can be used in locations where you would otherwise use
/// `RwLock<BTreeMap>` or `Mutex<BTreeMap>`. Every operation takes `&self`:
/// the map synchronises internally, and with the default
/// [`Strategy::ReadDirty`] the overwhelming majority of reads acquire no
/// lock at all. They resolve against an immutable committed snapshot of a
/// red-black tree, while a separate lock-protected tree absorbs new keys
/// until enough lookups have missed the snapshot to justify rebuilding it.
///
/// Operations on a single key are linearizable. Iteration observes one
/// consistent snapshot as of the moment it begins, not a live view.
///
/// # Examples
/// ```
/// use ordmap::OrderedMap;
///
/// let map: OrderedMap<&str, u64> = OrderedMap::new();
/// map.insert("c", 3);
/// map.insert("a", 1);
/// map.insert("b", 2);
///
/// assert_eq!(map.get(&"b"), Some(2));
///
/// // Iteration follows key order, not insertion order.
/// let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
/// assert_eq!(keys, vec!["a", "b", "c"]);
/// ```
pub struct OrderedMap<K, V> {
    inner: Inner<K, V>,
}

enum Inner<K, V> {
    ReadDirty(ReadDirty<K, V>),
    Locked(LockedTree<K, V>),
}

/// Configures and builds an [OrderedMap].
///
/// ```
/// use std::cmp::Reverse;
/// use ordmap::{OrderedMap, Strategy};
///
/// let map: OrderedMap<u64, ()> = OrderedMap::builder()
///     .strategy(Strategy::Locked)
///     .comparator(|a, b| Reverse(a).cmp(&Reverse(b)))
///     .build();
/// map.insert(1, ());
/// map.insert(2, ());
/// let keys: Vec<u64> = map.iter().map(|(k, _)| k).collect();
/// assert_eq!(keys, vec![2, 1]);
/// ```
pub struct OrderedMapBuilder<K, V> {
    strategy: Strategy,
    cmp: Option<Arc<CmpFn<K>>>,
    _marker: PhantomData<V>,
}

impl<K, V> OrderedMapBuilder<K, V>
where
    K: Clone + Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Select the concurrency strategy. Defaults to
    /// [`Strategy::ReadDirty`].
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Inject a three-way comparator to order keys by. Defaults to the key
    /// type's natural order.
    pub fn comparator<F>(mut self, cmp: F) -> Self
    where
        F: Fn(&K, &K) -> Ordering + Send + Sync + 'static,
    {
        self.cmp = Some(Arc::new(cmp));
        self
    }

    /// Construct the map.
    pub fn build(self) -> OrderedMap<K, V> {
        let cmp = self
            .cmp
            .unwrap_or_else(|| Arc::new(|a: &K, b: &K| a.cmp(b)));
        let inner = match self.strategy {
            Strategy::ReadDirty => Inner::ReadDirty(ReadDirty::new(cmp)),
            Strategy::Locked => Inner::Locked(LockedTree::new(cmp)),
        };
        OrderedMap { inner }
    }
}

impl<K, V> OrderedMap<K, V>
where
    K: Clone + Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Construct a new concurrent ordered map with the default strategy and
    /// the key type's natural order.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Begin configuring a map; see [OrderedMapBuilder].
    pub fn builder() -> OrderedMapBuilder<K, V> {
        OrderedMapBuilder {
            strategy: Strategy::default(),
            cmp: None,
            _marker: PhantomData,
        }
    }

    /// Retrieve the value stored for `key`. `None` if the key is not
    /// present.
    pub fn get(&self, key: &K) -> Option<V> {
        match &self.inner {
            Inner::ReadDirty(core) => core.get(key),
            Inner::Locked(tree) => tree.get(key),
        }
    }

    /// Assert if a key exists in the map.
    pub fn contains_key(&self, key: &K) -> bool {
        match &self.inner {
            Inner::ReadDirty(core) => core.contains_key(key),
            Inner::Locked(tree) => tree.get(key).is_some(),
        }
    }

    /// Store `value` under `key`, returning the previous value if the key
    /// was present.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        match &self.inner {
            Inner::ReadDirty(core) => core.swap(key, value),
            Inner::Locked(tree) => tree.swap(key, value),
        }
    }

    /// Return the value already stored for `key`, or store `value` and
    /// return that. The flag is true when an existing value was returned.
    pub fn get_or_insert(&self, key: K, value: V) -> (V, bool) {
        match &self.inner {
            Inner::ReadDirty(core) => core.get_or_insert(key, value),
            Inner::Locked(tree) => tree.get_or_insert(key, value),
        }
    }

    /// Delete `key`, returning the value it held.
    pub fn remove(&self, key: &K) -> Option<V> {
        match &self.inner {
            Inner::ReadDirty(core) => core.remove(key),
            Inner::Locked(tree) => tree.remove(key),
        }
    }

    /// Replace the value under `key` with `new` only while the stored value
    /// equals `current`. False when the key is absent or the value does not
    /// match.
    pub fn compare_and_swap(&self, key: &K, current: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        match &self.inner {
            Inner::ReadDirty(core) => core.compare_and_swap(key, current, new),
            Inner::Locked(tree) => tree.compare_and_swap(key, current, new),
        }
    }

    /// Delete `key` only while the stored value equals `current`.
    pub fn compare_and_remove(&self, key: &K, current: &V) -> bool
    where
        V: PartialEq,
    {
        match &self.inner {
            Inner::ReadDirty(core) => core.compare_and_remove(key, current),
            Inner::Locked(tree) => tree.compare_and_remove(key, current),
        }
    }

    /// Visit every pair in ascending key order. Returning false from the
    /// visitor stops the walk immediately.
    ///
    /// The walk observes one consistent view of the map as of the moment it
    /// begins; writes performed concurrently with the walk may or may not be
    /// visible through it.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        match &self.inner {
            Inner::ReadDirty(core) => core.for_each(f),
            Inner::Locked(tree) => tree.for_each(f),
        }
    }

    /// Iterate over owned `(key, value)` pairs in ascending key order, with
    /// the same consistency as [for_each](OrderedMap::for_each).
    pub fn iter(&self) -> Iter<K, V> {
        match &self.inner {
            Inner::ReadDirty(core) => Iter {
                inner: IterInner::Snapshot(core.iter()),
            },
            Inner::Locked(tree) => Iter {
                inner: IterInner::Collected(tree.collect_pairs().into_iter()),
            },
        }
    }

    /// The current number of live pairs in the map.
    pub fn len(&self) -> usize {
        match &self.inner {
            Inner::ReadDirty(core) => core.len(),
            Inner::Locked(tree) => tree.len(),
        }
    }

    /// Determine if the map is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for OrderedMap<K, V>
where
    K: Clone + Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Debug for OrderedMap<K, V>
where
    K: Clone + Ord + Debug + Send + Sync + 'static,
    V: Clone + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for OrderedMap<K, V>
where
    K: Clone + Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = OrderedMap::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl<K, V> Extend<(K, V)> for OrderedMap<K, V>
where
    K: Clone + Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

/// Owned-pair iterator over an [OrderedMap], in ascending key order.
pub struct Iter<K, V> {
    inner: IterInner<K, V>,
}

enum IterInner<K, V> {
    Snapshot(SnapshotIter<K, V>),
    Collected(std::vec::IntoIter<(K, V)>),
}

impl<K, V> Iterator for Iter<K, V>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        match &mut self.inner {
            IterInner::Snapshot(iter) => iter.next(),
            IterInner::Collected(iter) => iter.next(),
        }
    }
}

/// The serialised strategy: one tree, one mutex, taken per call.
struct LockedTree<K, V> {
    tree: Mutex<RbTree<K, V>>,
}

impl<K, V> LockedTree<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(cmp: Arc<CmpFn<K>>) -> Self {
        LockedTree {
            tree: Mutex::new(RbTree::new(cmp)),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let guard = epoch::pin();
        let tree = self.tree.lock().unwrap();
        tree.get(key).and_then(|n| n.entry().load(&guard)).cloned()
    }

    fn swap(&self, key: K, value: V) -> Option<V> {
        let guard = epoch::pin();
        let mut tree = self.tree.lock().unwrap();
        let found = tree.get(&key).map(|n| n.entry_arc());
        match found {
            Some(entry) => entry.swap_locked(value, &guard),
            None => {
                tree.insert(key, Arc::new(Entry::new(value)));
                None
            }
        }
    }

    fn get_or_insert(&self, key: K, value: V) -> (V, bool) {
        let guard = epoch::pin();
        let mut tree = self.tree.lock().unwrap();
        let found = tree.get(&key).map(|n| n.entry_arc());
        match found {
            Some(entry) => match entry.try_load_or_store(value, &guard) {
                Ok(result) => result,
                // Cells are never expunged outside the read/dirty protocol.
                Err(_) => unreachable!("expunged cell in locked tree"),
            },
            None => {
                let actual = value.clone();
                tree.insert(key, Arc::new(Entry::new(value)));
                (actual, false)
            }
        }
    }

    fn remove(&self, key: &K) -> Option<V> {
        let guard = epoch::pin();
        let mut tree = self.tree.lock().unwrap();
        tree.remove(key).and_then(|entry| entry.delete(&guard))
    }

    fn compare_and_swap(&self, key: &K, current: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let guard = epoch::pin();
        let tree = self.tree.lock().unwrap();
        tree.get(key)
            .map_or(false, |n| n.entry().try_compare_and_swap(current, new, &guard))
    }

    fn compare_and_remove(&self, key: &K, current: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = epoch::pin();
        let mut tree = self.tree.lock().unwrap();
        let matches = tree
            .get(key)
            .map_or(false, |n| n.entry().load(&guard) == Some(current));
        if matches {
            tree.remove(key);
            true
        } else {
            false
        }
    }

    fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let guard = epoch::pin();
        let tree = self.tree.lock().unwrap();
        for node in tree.iter() {
            if let Some(value) = node.entry().load(&guard) {
                if !f(node.key(), value) {
                    break;
                }
            }
        }
    }

    fn collect_pairs(&self) -> Vec<(K, V)> {
        let mut pairs = Vec::with_capacity(self.len());
        self.for_each(|k, v| {
            pairs.push((k.clone(), v.clone()));
            true
        });
        pairs
    }

    fn len(&self) -> usize {
        self.tree.lock().unwrap().len()
    }
}

#[cfg(feature = "serde")]
impl<K, V> Serialize for OrderedMap<K, V>
where
    K: Serialize + Clone + Ord + Send + Sync + 'static,
    V: Serialize + Clone + Send + Sync + 'static,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_map(Some(self.len()))?;

        for (key, val) in self.iter() {
            state.serialize_entry(&key, &val)?;
        }

        state.end()
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> Deserialize<'de> for OrderedMap<K, V>
where
    K: Deserialize<'de> + Clone + Ord + Send + Sync + 'static,
    V: Deserialize<'de> + Clone + Send + Sync + 'static,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(MapCollector::new())
    }
}

#[cfg(test)]
mod tests {
    use super::{OrderedMap, Strategy};
    use std::thread::scope;

    fn both_strategies() -> Vec<OrderedMap<u64, u64>> {
        vec![
            OrderedMap::new(),
            OrderedMap::builder().strategy(Strategy::Locked).build(),
        ]
    }

    #[test]
    fn test_map_insert_get_remove() {
        for map in both_strategies() {
            assert_eq!(map.insert(1, 10), None);
            assert_eq!(map.insert(1, 11), Some(10));
            assert_eq!(map.get(&1), Some(11));
            assert!(map.contains_key(&1));
            assert_eq!(map.len(), 1);

            assert_eq!(map.remove(&1), Some(11));
            assert_eq!(map.get(&1), None);
            assert!(!map.contains_key(&1));
            assert!(map.is_empty());
            assert_eq!(map.remove(&1), None);
        }
    }

    #[test]
    fn test_map_ordered_range() {
        // Store "a", "c", "b"; the walk must yield a, b, c.
        for map in [
            OrderedMap::<&str, u64>::new(),
            OrderedMap::builder().strategy(Strategy::Locked).build(),
        ] {
            map.insert("a", 1);
            map.insert("c", 3);
            map.insert("b", 2);
            let pairs: Vec<(&str, u64)> = map.iter().collect();
            assert_eq!(pairs, vec![("a", 1), ("b", 2), ("c", 3)]);

            map.remove(&"b");
            let pairs: Vec<(&str, u64)> = map.iter().collect();
            assert_eq!(pairs, vec![("a", 1), ("c", 3)]);
            assert_eq!(map.get(&"b"), None);
            assert!(!map.contains_key(&"b"));
        }
    }

    #[test]
    fn test_map_for_each_stop() {
        for map in both_strategies() {
            for k in 0..100 {
                map.insert(k, k);
            }
            let mut seen = 0;
            map.for_each(|_, _| {
                seen += 1;
                seen < 10
            });
            assert_eq!(seen, 10);
        }
    }

    #[test]
    fn test_map_compare_ops() {
        for map in both_strategies() {
            map.insert(1, 10);
            assert!(!map.compare_and_swap(&1, &9, 20));
            assert_eq!(map.get(&1), Some(10));
            assert!(map.compare_and_swap(&1, &10, 20));
            assert_eq!(map.get(&1), Some(20));

            assert!(!map.compare_and_remove(&1, &10));
            assert!(map.contains_key(&1));
            assert!(map.compare_and_remove(&1, &20));
            assert!(!map.contains_key(&1));
        }
    }

    #[test]
    fn test_map_get_or_insert() {
        for map in both_strategies() {
            assert_eq!(map.get_or_insert(5, 50), (50, false));
            assert_eq!(map.get_or_insert(5, 51), (50, true));
            assert_eq!(map.len(), 1);
        }
    }

    #[test]
    fn test_map_custom_comparator() {
        let map: OrderedMap<u64, u64> = OrderedMap::builder()
            .comparator(|a: &u64, b| b.cmp(a))
            .build();
        for k in [1, 3, 2] {
            map.insert(k, k);
        }
        let keys: Vec<u64> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![3, 2, 1]);
    }

    #[test]
    fn test_map_from_iter_debug() {
        let map: OrderedMap<u64, u64> = [(2, 20), (1, 10)].into_iter().collect();
        assert_eq!(map.len(), 2);
        assert_eq!(format!("{:?}", map), "{1: 10, 2: 20}");
    }

    #[test]
    fn test_map_extend() {
        let mut map: OrderedMap<u64, u64> = OrderedMap::new();
        map.extend([(1, 10), (2, 20)]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_map_multithread_load_or_store() {
        // Under a race, exactly one caller must win the store and every
        // caller must observe the same final value.
        for _ in 0..64 {
            let map: OrderedMap<u64, u64> = OrderedMap::new();
            let winners = scope(|scope| {
                let handles: Vec<_> = (0..8)
                    .map(|tid| {
                        let map_ref = &map;
                        scope.spawn(move || map_ref.get_or_insert(1, tid))
                    })
                    .collect();
                let results: Vec<(u64, bool)> =
                    handles.into_iter().map(|h| h.join().unwrap()).collect();
                let actual = results[0].0;
                assert!(results.iter().all(|(v, _)| *v == actual));
                results.iter().filter(|(_, loaded)| !loaded).count()
            });
            assert_eq!(winners, 1);
            assert_eq!(map.len(), 1);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_map_multithread_churn() {
        let _ = tracing_subscriber::fmt::try_init();
        let map: OrderedMap<u64, u64> = OrderedMap::new();

        scope(|scope| {
            let writers: Vec<_> = (0..4_u64)
                .map(|tid| {
                    let map_ref = &map;
                    scope.spawn(move || {
                        // Disjoint key ranges per thread.
                        let base = tid * 1000;
                        for k in base..base + 500 {
                            map_ref.insert(k, k);
                        }
                        for k in (base..base + 500).step_by(2) {
                            assert_eq!(map_ref.remove(&k), Some(k));
                        }
                    })
                })
                .collect();

            let readers: Vec<_> = (0..4_u64)
                .map(|_| {
                    let map_ref = &map;
                    scope.spawn(move || {
                        for _ in 0..50 {
                            // Iteration stays strictly ordered whatever the
                            // writers are doing.
                            let keys: Vec<u64> = map_ref.iter().map(|(k, _)| k).collect();
                            assert!(keys.windows(2).all(|w| w[0] < w[1]));
                            for k in 0..100 {
                                map_ref.get(&k);
                            }
                        }
                    })
                })
                .collect();

            for h in writers {
                h.join().unwrap();
            }
            for h in readers {
                h.join().unwrap();
            }
        });

        // 4 writers x 500 inserts, half of each range removed again.
        assert_eq!(map.len(), 4 * 250);
        let keys: Vec<u64> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 4 * 250);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(keys.iter().all(|k| k % 2 == 1));
    }
}
