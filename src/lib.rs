//! # brood
//!
//! An unordered bucket container with stable element references.
//!
//! ## Design Philosophy
//!
//! `Brood<T>` targets workloads (simulations, entity systems, intrusive
//! graphs) that would otherwise reach for a node-per-element linked list:
//! elements never move, so pointers and cursors to surviving elements stay
//! valid across every insertion and erasure of *other* elements. Unlike a
//! linked list, elements live in contiguous blocks, so iteration stays
//! cache-friendly and insertion is amortised O(1) without per-element
//! allocation.
//!
//! ## Storage layout
//!
//! - Elements live in a doubly-linked chain of heap blocks, each pairing
//!   an element array with a parallel jump-counting skipfield.
//! - A live slot's skipfield word is zero; a run of erased slots stores
//!   the run length at both endpoints, so traversal hops a whole run with
//!   one read.
//! - Erased slots are recycled through a per-block intrusive free list
//!   threaded through the erased slots themselves, LIFO, so reuse stays
//!   close to recent activity.
//! - Block capacities grow geometrically with the container, between
//!   configurable [`Limits`].
//!
//! ## Insertion priority
//!
//! 1. Reuse an erased slot (from the most recently erased-into block)
//! 2. Append to the tail block
//! 3. Revive a cached empty block
//! 4. Allocate a new block
//!
//! ## Ordering
//!
//! Iteration order is unspecified: erasing and reinserting can reorder
//! traversal. Anything order-sensitive should sort first.
//!
//! ## Example
//!
//! ```
//! let mut bees = brood::Brood::<&str>::new();
//! let worker = bees.insert("worker");
//! bees.insert("drone");
//! bees.insert("queen");
//!
//! // Erasing one element never moves the others.
//! let queen_ptr = bees.iter().find(|s| **s == "queen").map(|s| s as *const _);
//! unsafe { bees.erase(worker) };
//! assert_eq!(bees.len(), 2);
//! assert!(bees.get_cursor(queen_ptr.unwrap()).is_some());
//! ```

#![warn(missing_docs)]

mod brood;
mod cursor;
mod error;
mod group;
mod iter;
mod skipfield;

pub use brood::Brood;
pub use cursor::Cursor;
pub use error::BroodError;
pub use iter::{IntoIter, Iter, IterMut};
pub use skipfield::SkipWord;

// =============================================================================
// Limits
// =============================================================================

/// Block-capacity policy: every block holds between `min` and `max`
/// elements.
///
/// The hard bounds are `[3, W::MAX]` for skipfield word type `W`; see
/// [`Brood::block_capacity_hard_limits`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Smallest capacity a block may be created with.
    pub min: usize,
    /// Largest capacity a block may be created with.
    pub max: usize,
}

impl Limits {
    /// Creates a limits pair. Validation happens at the point of use.
    #[inline]
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }
}
