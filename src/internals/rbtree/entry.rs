//! The per-node value cell.
//!
//! Every tree node carries an [`Entry`] - an atomically swappable pointer to
//! the node's current value. The cell has three logical states:
//!
//! * *absent* - a null pointer. The key exists structurally but holds no
//!   value (it was deleted, or is mid-installation).
//! * *present* - a pointer to a heap allocated value.
//! * *expunged* - a tagged null pointer. The entry has been dropped from the
//!   dirty tree during a promotion sweep. A writer that observes this state
//!   must not resurrect the cell directly; it has to take the locked path so
//!   the entry can be re-linked into the dirty tree first.
//!
//! All transitions are compare-and-swap loops. They retry on contention and
//! never block. Superseded values are released through the epoch collector,
//! because a concurrent reader may still hold the old pointer.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

/// Tag carried by the null pointer that marks an expunged cell.
const TAG_EXPUNGED: usize = 1;

/// Heap slot for a stored value. The explicit alignment guarantees at least
/// one low pointer bit is free to carry the expunged tag, whatever `V` is.
#[repr(align(2))]
#[derive(Debug)]
struct Slot<V>(V);

#[inline]
fn expunged<'g, V>() -> Shared<'g, Slot<V>> {
    Shared::null().with_tag(TAG_EXPUNGED)
}

#[inline]
fn is_expunged<V>(p: Shared<'_, Slot<V>>) -> bool {
    p.is_null() && p.tag() == TAG_EXPUNGED
}

/// An atomically swappable value cell, shared between the committed snapshot
/// tree and the dirty tree via `Arc`.
///
/// Sharing the cell (rather than copying the value) is what makes a fast-path
/// write against the snapshot visible after the next promotion: both trees
/// observe the same pointer.
#[derive(Debug)]
pub struct Entry<V> {
    value: Atomic<Slot<V>>,
}

impl<V> Entry<V> {
    /// Create a cell in the *present* state.
    pub fn new(value: V) -> Self {
        Entry {
            value: Atomic::new(Slot(value)),
        }
    }

    /// Read the current value. Returns `None` for absent and expunged cells.
    pub fn load<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        let p = self.value.load(Acquire, guard);
        unsafe { p.as_ref() }.map(|slot| &slot.0)
    }

    /// Swap in `value`, returning the previous value if one was present.
    ///
    /// Fails with `Err(value)` if the cell is expunged - the caller must fall
    /// back to the locked path and unexpunge first.
    pub fn try_swap(&self, value: V, guard: &Guard) -> Result<Option<V>, V>
    where
        V: Clone,
    {
        let mut p = self.value.load(Acquire, guard);
        if is_expunged(p) {
            return Err(value);
        }
        let mut new = Owned::new(Slot(value));
        loop {
            match self.value.compare_exchange(p, new, AcqRel, Acquire, guard) {
                Ok(_) => {
                    let previous = unsafe { p.as_ref() }.map(|slot| slot.0.clone());
                    if !p.is_null() {
                        unsafe { guard.defer_destroy(p) };
                    }
                    return Ok(previous);
                }
                Err(e) => {
                    p = e.current;
                    new = e.new;
                    if is_expunged(p) {
                        let Slot(value) = *new.into_box();
                        return Err(value);
                    }
                }
            }
        }
    }

    /// Unconditionally swap in `value`. Lock held; the caller has already
    /// unexpunged the cell, so the expunged state cannot be observed here.
    pub fn swap_locked(&self, value: V, guard: &Guard) -> Option<V>
    where
        V: Clone,
    {
        let p = self.value.swap(Owned::new(Slot(value)), AcqRel, guard);
        let previous = unsafe { p.as_ref() }.map(|slot| slot.0.clone());
        if !p.is_null() {
            unsafe { guard.defer_destroy(p) };
        }
        previous
    }

    /// Replace the value with `new` only while the stored value compares
    /// equal to `current`. Retries on contention as long as the comparison
    /// still holds; fails immediately once it does not, or if the cell is
    /// absent or expunged.
    pub fn try_compare_and_swap(&self, current: &V, new: V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut p = self.value.load(Acquire, guard);
        match unsafe { p.as_ref() } {
            Some(slot) if slot.0 == *current => {}
            _ => return false,
        }
        let mut new = Owned::new(Slot(new));
        loop {
            match self.value.compare_exchange(p, new, AcqRel, Acquire, guard) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(p) };
                    return true;
                }
                Err(e) => {
                    p = e.current;
                    new = e.new;
                    match unsafe { p.as_ref() } {
                        Some(slot) if slot.0 == *current => {}
                        _ => return false,
                    }
                }
            }
        }
    }

    /// Return the stored value if present, otherwise install `value`.
    ///
    /// `Ok((actual, loaded))` mirrors the load-or-store contract: `loaded` is
    /// true when an existing value was returned. `Err(value)` signals an
    /// expunged cell and hands the candidate back for the locked retry.
    pub fn try_load_or_store(&self, value: V, guard: &Guard) -> Result<(V, bool), V>
    where
        V: Clone,
    {
        let p = self.value.load(Acquire, guard);
        if is_expunged(p) {
            return Err(value);
        }
        if let Some(slot) = unsafe { p.as_ref() } {
            return Ok((slot.0.clone(), true));
        }
        let mut new = Owned::new(Slot(value));
        loop {
            match self
                .value
                .compare_exchange(Shared::null(), new, AcqRel, Acquire, guard)
            {
                Ok(installed) => {
                    return Ok((unsafe { installed.deref() }.0.clone(), false));
                }
                Err(e) => {
                    new = e.new;
                    let p = e.current;
                    if is_expunged(p) {
                        let Slot(value) = *new.into_box();
                        return Err(value);
                    }
                    if let Some(slot) = unsafe { p.as_ref() } {
                        return Ok((slot.0.clone(), true));
                    }
                }
            }
        }
    }

    /// Clear a present value, returning it. `None` if the cell was already
    /// absent or expunged.
    pub fn delete(&self, guard: &Guard) -> Option<V>
    where
        V: Clone,
    {
        let mut p = self.value.load(Acquire, guard);
        loop {
            if p.is_null() {
                return None;
            }
            match self
                .value
                .compare_exchange(p, Shared::null(), AcqRel, Acquire, guard)
            {
                Ok(_) => {
                    let value = unsafe { p.deref() }.0.clone();
                    unsafe { guard.defer_destroy(p) };
                    return Some(value);
                }
                Err(e) => p = e.current,
            }
        }
    }

    /// Clear the value only while it compares equal to `current`.
    pub fn compare_and_delete(&self, current: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut p = self.value.load(Acquire, guard);
        loop {
            match unsafe { p.as_ref() } {
                Some(slot) if slot.0 == *current => {}
                _ => return false,
            }
            match self
                .value
                .compare_exchange(p, Shared::null(), AcqRel, Acquire, guard)
            {
                Ok(_) => {
                    unsafe { guard.defer_destroy(p) };
                    return true;
                }
                Err(e) => p = e.current,
            }
        }
    }

    /// Move an absent cell to the expunged state. Called only during the
    /// promotion sweep, with the controller lock held. Returns true if the
    /// cell ends up expunged, including when it already was.
    pub fn try_expunge_locked(&self, guard: &Guard) -> bool {
        let mut p = self.value.load(Acquire, guard);
        while p.is_null() && p.tag() != TAG_EXPUNGED {
            match self
                .value
                .compare_exchange(Shared::null(), expunged(), AcqRel, Acquire, guard)
            {
                Ok(_) => return true,
                Err(e) => p = e.current,
            }
        }
        is_expunged(p)
    }

    /// Move an expunged cell back to absent, so a locked writer can relink
    /// the entry into the dirty tree and then store through it. Returns true
    /// if this call performed the transition.
    pub fn unexpunge_locked(&self, guard: &Guard) -> bool {
        self.value
            .compare_exchange(expunged(), Shared::null(), AcqRel, Acquire, guard)
            .is_ok()
    }
}

impl<V> Drop for Entry<V> {
    fn drop(&mut self) {
        // Last reference to the cell; no concurrent access remains possible.
        let p = unsafe { self.value.load(Relaxed, epoch::unprotected()) };
        if !p.is_null() {
            drop(unsafe { p.into_owned() });
        }
    }
}
