//! The red-black tree engine.
//!
//! A self-balancing binary search tree keyed by an injected three-way
//! comparator. Nodes own their children (`Box` linkage flattened to raw
//! pointers) and carry a non-owning parent back-pointer so that successor
//! and predecessor walks, and the insert/delete fixups, run without any
//! recursion state. The tree itself is not concurrency aware: structural
//! mutation requires exclusive access (`&mut self`), which the read/dirty
//! controller provides by only ever mutating the lock-held dirty tree.
//!
//! Values do not live in the nodes directly. Each node holds an
//! `Arc<Entry<V>>` value cell, so the same cell can be linked into both the
//! committed snapshot tree and the dirty tree.

pub mod entry;
pub mod iter;

pub use self::entry::Entry;
pub use self::iter::NodeIter;

use std::cmp::Ordering;
use std::mem;
use std::ptr;
use std::sync::Arc;

/// The injected key comparator. Defaults to `Ord::cmp` at the facade.
pub type CmpFn<K> = dyn Fn(&K, &K) -> Ordering + Send + Sync;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Color {
    Red,
    Black,
}

/// A tree node: immutable key, shared value cell, colour and linkage.
///
/// Nodes are only ever handed out as shared references borrowed from their
/// tree. The parent/child pointers are an implementation detail; the public
/// surface is the key, the value cell, and ordered navigation.
pub struct Node<K, V> {
    key: K,
    entry: Arc<Entry<V>>,
    color: Color,
    parent: *mut Node<K, V>,
    left: *mut Node<K, V>,
    right: *mut Node<K, V>,
}

impl<K, V> Node<K, V> {
    /// The node's key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The node's value cell.
    pub fn entry(&self) -> &Entry<V> {
        &self.entry
    }

    /// A shared handle on the node's value cell, valid beyond the borrow of
    /// the tree. This is how a cell outlives structural removal.
    pub fn entry_arc(&self) -> Arc<Entry<V>> {
        self.entry.clone()
    }

    /// In-order successor.
    pub fn next(&self) -> Option<&Node<K, V>> {
        unsafe { successor(self as *const _ as *mut Node<K, V>).as_ref() }
    }

    /// In-order predecessor.
    pub fn prev(&self) -> Option<&Node<K, V>> {
        unsafe { predecessor(self as *const _ as *mut Node<K, V>).as_ref() }
    }
}

#[inline]
unsafe fn color_of<K, V>(n: *mut Node<K, V>) -> Color {
    // Leaves (null) are black.
    if n.is_null() {
        Color::Black
    } else {
        (*n).color
    }
}

unsafe fn minimum<K, V>(mut n: *mut Node<K, V>) -> *mut Node<K, V> {
    while !(*n).left.is_null() {
        n = (*n).left;
    }
    n
}

unsafe fn maximum<K, V>(mut n: *mut Node<K, V>) -> *mut Node<K, V> {
    while !(*n).right.is_null() {
        n = (*n).right;
    }
    n
}

unsafe fn successor<K, V>(x: *mut Node<K, V>) -> *mut Node<K, V> {
    if !(*x).right.is_null() {
        return minimum((*x).right);
    }
    let mut x = x;
    let mut y = (*x).parent;
    while !y.is_null() && x == (*y).right {
        x = y;
        y = (*x).parent;
    }
    y
}

unsafe fn predecessor<K, V>(x: *mut Node<K, V>) -> *mut Node<K, V> {
    if !(*x).left.is_null() {
        return maximum((*x).left);
    }
    let mut x = x;
    let mut y = (*x).parent;
    while !y.is_null() && x == (*y).left {
        x = y;
        y = (*x).parent;
    }
    y
}

/// The ordered index. Owns its nodes; in-order traversal yields strictly
/// increasing keys under the injected comparator.
pub struct RbTree<K, V> {
    root: *mut Node<K, V>,
    size: usize,
    cmp: Arc<CmpFn<K>>,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for RbTree<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for RbTree<K, V> {}

impl<K, V> RbTree<K, V> {
    /// Create an empty tree ordered by `cmp`.
    pub fn new(cmp: Arc<CmpFn<K>>) -> Self {
        RbTree {
            root: ptr::null_mut(),
            size: 0,
            cmp,
        }
    }

    /// Number of nodes, live or tombstoned.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when the tree holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The comparator this tree was built with.
    pub fn comparator(&self) -> &Arc<CmpFn<K>> {
        &self.cmp
    }

    fn find_ptr(&self, key: &K) -> *mut Node<K, V> {
        let mut x = self.root;
        unsafe {
            while !x.is_null() {
                match (self.cmp)(key, &(*x).key) {
                    Ordering::Less => x = (*x).left,
                    Ordering::Equal => return x,
                    Ordering::Greater => x = (*x).right,
                }
            }
        }
        ptr::null_mut()
    }

    /// Find the node holding `key`.
    pub fn get(&self, key: &K) -> Option<&Node<K, V>> {
        unsafe { self.find_ptr(key).as_ref() }
    }

    /// The node with the minimum key.
    pub fn first(&self) -> Option<&Node<K, V>> {
        if self.root.is_null() {
            return None;
        }
        unsafe { minimum(self.root).as_ref() }
    }

    /// The node with the maximum key.
    pub fn last(&self) -> Option<&Node<K, V>> {
        if self.root.is_null() {
            return None;
        }
        unsafe { maximum(self.root).as_ref() }
    }

    /// The first node whose key is greater than or equal to `key`.
    pub fn lower_bound(&self, key: &K) -> Option<&Node<K, V>> {
        unsafe { self.lower_bound_in(self.root, key).as_ref() }
    }

    fn lower_bound_in(&self, x: *mut Node<K, V>, key: &K) -> *mut Node<K, V> {
        if x.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            if (self.cmp)(key, &(*x).key) != Ordering::Greater {
                // Anything in the left subtree is a tighter candidate.
                let ret = self.lower_bound_in((*x).left, key);
                if ret.is_null() {
                    x
                } else {
                    ret
                }
            } else {
                self.lower_bound_in((*x).right, key)
            }
        }
    }

    /// The first node whose key is strictly greater than `key`.
    pub fn upper_bound(&self, key: &K) -> Option<&Node<K, V>> {
        unsafe { self.upper_bound_in(self.root, key).as_ref() }
    }

    fn upper_bound_in(&self, x: *mut Node<K, V>, key: &K) -> *mut Node<K, V> {
        if x.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            if (self.cmp)(key, &(*x).key) != Ordering::Less {
                self.upper_bound_in((*x).right, key)
            } else {
                let ret = self.upper_bound_in((*x).left, key);
                if ret.is_null() {
                    x
                } else {
                    ret
                }
            }
        }
    }

    /// In-order cursor over the nodes.
    pub fn iter(&self) -> NodeIter<'_, K, V> {
        NodeIter::new(self.first())
    }

    /// Attach a new node for `key` carrying `entry`, then rebalance.
    ///
    /// Caller contract: `key` is not already in the tree. Existence must be
    /// checked first; there is no duplicate handling here.
    pub fn insert(&mut self, key: K, entry: Arc<Entry<V>>) {
        let mut x = self.root;
        let mut y: *mut Node<K, V> = ptr::null_mut();
        unsafe {
            while !x.is_null() {
                y = x;
                x = if (self.cmp)(&key, &(*x).key) == Ordering::Less {
                    (*x).left
                } else {
                    (*x).right
                };
            }

            let z = Box::into_raw(Box::new(Node {
                key,
                entry,
                color: Color::Red,
                parent: y,
                left: ptr::null_mut(),
                right: ptr::null_mut(),
            }));
            self.size += 1;

            if y.is_null() {
                (*z).color = Color::Black;
                self.root = z;
                return;
            } else if (self.cmp)(&(*z).key, &(*y).key) == Ordering::Less {
                (*y).left = z;
            } else {
                (*y).right = z;
            }
            self.insert_fixup(z);
        }
    }

    unsafe fn insert_fixup(&mut self, mut z: *mut Node<K, V>) {
        while !(*z).parent.is_null() && (*(*z).parent).color == Color::Red {
            // A red parent is never the root, so the grandparent exists.
            let parent = (*z).parent;
            let grand = (*parent).parent;
            if parent == (*grand).left {
                let uncle = (*grand).right;
                if !uncle.is_null() && (*uncle).color == Color::Red {
                    (*parent).color = Color::Black;
                    (*uncle).color = Color::Black;
                    (*grand).color = Color::Red;
                    z = grand;
                } else {
                    if z == (*parent).right {
                        z = parent;
                        self.rotate_left(z);
                    }
                    (*(*z).parent).color = Color::Black;
                    (*(*(*z).parent).parent).color = Color::Red;
                    self.rotate_right((*(*z).parent).parent);
                }
            } else {
                let uncle = (*grand).left;
                if !uncle.is_null() && (*uncle).color == Color::Red {
                    (*parent).color = Color::Black;
                    (*uncle).color = Color::Black;
                    (*grand).color = Color::Red;
                    z = grand;
                } else {
                    if z == (*parent).left {
                        z = parent;
                        self.rotate_right(z);
                    }
                    (*(*z).parent).color = Color::Black;
                    (*(*(*z).parent).parent).color = Color::Red;
                    self.rotate_left((*(*z).parent).parent);
                }
            }
        }
        (*self.root).color = Color::Black;
    }

    /// Structurally remove `key`, returning its value cell.
    ///
    /// The cell is captured before the successor splice, so the returned
    /// handle is always the one that belonged to `key`, never the spliced
    /// neighbour's.
    pub fn remove(&mut self, key: &K) -> Option<Arc<Entry<V>>> {
        let z = self.find_ptr(key);
        if z.is_null() {
            return None;
        }
        let entry = unsafe { (*z).entry.clone() };
        unsafe { self.delete_node(z) };
        Some(entry)
    }

    unsafe fn delete_node(&mut self, z: *mut Node<K, V>) {
        // With two children, splice the in-order successor into z's place
        // and structurally unlink the successor (which has at most one
        // child) instead.
        let y = if (*z).left.is_null() || (*z).right.is_null() {
            z
        } else {
            successor(z)
        };
        let x = if !(*y).left.is_null() {
            (*y).left
        } else {
            (*y).right
        };

        let xparent = (*y).parent;
        if !x.is_null() {
            (*x).parent = xparent;
        }
        if (*y).parent.is_null() {
            self.root = x;
        } else if y == (*(*y).parent).left {
            (*(*y).parent).left = x;
        } else {
            (*(*y).parent).right = x;
        }

        let unlinked_color = (*y).color;
        if y != z {
            mem::swap(&mut (*z).key, &mut (*y).key);
            mem::swap(&mut (*z).entry, &mut (*y).entry);
        }

        if unlinked_color == Color::Black {
            self.delete_fixup(x, xparent);
        }
        drop(Box::from_raw(y));
        self.size -= 1;
    }

    unsafe fn delete_fixup(&mut self, mut x: *mut Node<K, V>, mut parent: *mut Node<K, V>) {
        // x carries a double-black deficiency; push it up until absorbed.
        while x != self.root && color_of(x) == Color::Black {
            if !x.is_null() {
                parent = (*x).parent;
            }
            if x == (*parent).left {
                x = self.fixup_left(x, parent);
            } else {
                x = self.fixup_right(x, parent);
            }
        }
        if !x.is_null() {
            (*x).color = Color::Black;
        }
    }

    #[allow(unused_assignments)]
    unsafe fn fixup_left(
        &mut self,
        mut x: *mut Node<K, V>,
        parent: *mut Node<K, V>,
    ) -> *mut Node<K, V> {
        let mut w = (*parent).right;
        if (*w).color == Color::Red {
            (*w).color = Color::Black;
            (*parent).color = Color::Red;
            self.rotate_left(parent);
            w = (*parent).right;
        }
        if color_of((*w).left) == Color::Black && color_of((*w).right) == Color::Black {
            (*w).color = Color::Red;
            x = parent;
        } else {
            if color_of((*w).right) == Color::Black {
                if !(*w).left.is_null() {
                    (*(*w).left).color = Color::Black;
                }
                (*w).color = Color::Red;
                self.rotate_right(w);
                w = (*parent).right;
            }
            (*w).color = (*parent).color;
            (*parent).color = Color::Black;
            if !(*w).right.is_null() {
                (*(*w).right).color = Color::Black;
            }
            self.rotate_left(parent);
            x = self.root;
        }
        x
    }

    #[allow(unused_assignments)]
    unsafe fn fixup_right(
        &mut self,
        mut x: *mut Node<K, V>,
        parent: *mut Node<K, V>,
    ) -> *mut Node<K, V> {
        let mut w = (*parent).left;
        if (*w).color == Color::Red {
            (*w).color = Color::Black;
            (*parent).color = Color::Red;
            self.rotate_right(parent);
            w = (*parent).left;
        }
        if color_of((*w).left) == Color::Black && color_of((*w).right) == Color::Black {
            (*w).color = Color::Red;
            x = parent;
        } else {
            if color_of((*w).left) == Color::Black {
                if !(*w).right.is_null() {
                    (*(*w).right).color = Color::Black;
                }
                (*w).color = Color::Red;
                self.rotate_left(w);
                w = (*parent).left;
            }
            (*w).color = (*parent).color;
            (*parent).color = Color::Black;
            if !(*w).left.is_null() {
                (*(*w).left).color = Color::Black;
            }
            self.rotate_right(parent);
            x = self.root;
        }
        x
    }

    unsafe fn rotate_left(&mut self, x: *mut Node<K, V>) {
        let y = (*x).right;
        (*x).right = (*y).left;
        if !(*y).left.is_null() {
            (*(*y).left).parent = x;
        }
        (*y).parent = (*x).parent;
        if (*x).parent.is_null() {
            self.root = y;
        } else if x == (*(*x).parent).left {
            (*(*x).parent).left = y;
        } else {
            (*(*x).parent).right = y;
        }
        (*y).left = x;
        (*x).parent = y;
    }

    unsafe fn rotate_right(&mut self, x: *mut Node<K, V>) {
        let y = (*x).left;
        (*x).left = (*y).right;
        if !(*y).right.is_null() {
            (*(*y).right).parent = x;
        }
        (*y).parent = (*x).parent;
        if (*x).parent.is_null() {
            self.root = y;
        } else if x == (*(*x).parent).right {
            (*(*x).parent).right = y;
        } else {
            (*(*x).parent).left = y;
        }
        (*y).right = x;
        (*x).parent = y;
    }
}

impl<K, V> Drop for RbTree<K, V> {
    fn drop(&mut self) {
        unsafe fn drop_subtree<K, V>(n: *mut Node<K, V>) {
            if n.is_null() {
                return;
            }
            drop_subtree((*n).left);
            drop_subtree((*n).right);
            drop(Box::from_raw(n));
        }
        unsafe { drop_subtree(self.root) };
    }
}

#[cfg(test)]
impl<K, V> RbTree<K, V> {
    /// Assert every red-black and ordering invariant, plus size consistency.
    pub(crate) fn verify_invariants(&self) {
        unsafe {
            if !self.root.is_null() {
                assert_eq!((*self.root).color, Color::Black, "root must be black");
                assert!((*self.root).parent.is_null());
            }
            let mut count = 0;
            self.verify_node(self.root, &mut count);
            assert_eq!(count, self.size, "node count must match size");
        }

        let mut prev: Option<&K> = None;
        for node in self.iter() {
            if let Some(p) = prev {
                assert_eq!(
                    (self.cmp)(p, node.key()),
                    Ordering::Less,
                    "in-order keys must be strictly increasing"
                );
            }
            prev = Some(node.key());
        }
    }

    unsafe fn verify_node(&self, n: *mut Node<K, V>, count: &mut usize) -> usize {
        if n.is_null() {
            return 1;
        }
        *count += 1;
        if (*n).color == Color::Red {
            assert_eq!(color_of((*n).left), Color::Black, "red node with red child");
            assert_eq!(
                color_of((*n).right),
                Color::Black,
                "red node with red child"
            );
        }
        if !(*n).left.is_null() {
            assert_eq!((*(*n).left).parent, n, "left child parent link");
        }
        if !(*n).right.is_null() {
            assert_eq!((*(*n).right).parent, n, "right child parent link");
        }
        let lh = self.verify_node((*n).left, count);
        let rh = self.verify_node((*n).right, count);
        assert_eq!(lh, rh, "black height must be equal on both sides");
        lh + usize::from((*n).color == Color::Black)
    }
}
