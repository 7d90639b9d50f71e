//! Ordmap - A concurrently readable ordered map
//!
//! [OrderedMap] is a map whose iteration order always follows key order,
//! built for concurrent access from many threads without a single global
//! lock serialising every operation.
//!
//! Under the default strategy the map keeps an immutable *committed*
//! red-black tree, published through an atomic pointer, and a mutable
//! *dirty* tree behind a coarse mutex. Reads resolve lock free against the
//! committed tree whenever it can answer authoritatively; only lookups the
//! committed tree cannot answer take the lock, and each one of those pays
//! towards promoting the dirty tree into the next committed snapshot. The
//! result is that a read-mostly workload almost never contends, while the
//! rebuild cost of the committed view is amortised across the misses that
//! made it necessary.
//!
//! Values live in per-entry atomic cells, so updates and deletes of known
//! keys are plain compare-and-swap loops even when they land on the
//! committed tree. Operations on a single key are linearizable; iteration
//! observes one consistent snapshot, in ascending key order.
//!
//! If your workload is write-heavy or single-threaded, construct the map
//! with [Strategy::Locked] instead: the identical operation set backed by
//! one tree behind one mutex, with none of the snapshot machinery.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]

// This is where the scary rust lives.
pub mod internals;

pub mod orderedmap;
pub use orderedmap::{OrderedMap, OrderedMapBuilder, Strategy};

#[cfg(feature = "serde")]
mod utils;
