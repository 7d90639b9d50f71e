//! This module contains the internals of the concurrent ordered map. You
//! should turn back now. Nothing of value is here. This module can only
//! inflict horror upon you.
//!
//! It exists so that the tree engine and the read/dirty controller can be
//! composed or inspected by external code that knows exactly what it is
//! doing. The raw-pointer tree in here is not concurrency aware, and
//! holding node references across structural mutation is undefined
//! behaviour. If you handle this module at all, you will probably cause
//! space time to unravel.
//!
//! ⚠️   ⚠️   ⚠️

pub mod rbtree;
pub mod readdirty;
