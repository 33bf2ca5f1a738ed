//! The container: block-chain state, the insertion and erasure engines,
//! and the bulk operations.

use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use crate::Limits;
use crate::cursor::Cursor;
use crate::error::BroodError;
use crate::group::{Group, Slot};
use crate::iter::{Iter, IterMut};
use crate::skipfield::SkipWord;

// =============================================================================
// Brood
// =============================================================================

/// An unordered collection with stable references and O(1) amortised
/// insert and erase.
///
/// `W` selects the skipfield word width: `u16` (default) favours raw
/// performance with fewer, larger blocks; `u8` lowers per-block overhead
/// for memory-constrained use; `u32` permits very large blocks.
///
/// Cursors ([`Cursor`]) are copyable raw positions. Obtaining them is
/// safe; erasing through them is `unsafe` because validity cannot be
/// checked in constant time. Safe mutation goes through [`Brood::iter_mut`],
/// [`Brood::erase_if`] and [`Brood::erase_value`].
pub struct Brood<T, W: SkipWord = u16> {
    pub(crate) end: Cursor<T, W>,
    pub(crate) begin: Cursor<T, W>,
    /// Blocks holding reusable erased slots, newest first.
    erasure_groups_head: *mut Group<T, W>,
    /// Empty blocks retained for reuse, threaded through `next_group`.
    unused_groups_head: *mut Group<T, W>,
    pub(crate) len: usize,
    capacity: usize,
    min_group_capacity: usize,
    max_group_capacity: usize,
    _owns: PhantomData<T>,
}

unsafe impl<T: Send, W: SkipWord> Send for Brood<T, W> {}
unsafe impl<T: Sync, W: SkipWord> Sync for Brood<T, W> {}

impl<T, W: SkipWord> Default for Brood<T, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, W: SkipWord> Brood<T, W> {
    /// Creates an empty container. Does not allocate.
    pub fn new() -> Self {
        Self {
            end: Cursor::null(),
            begin: Cursor::null(),
            erasure_groups_head: ptr::null_mut(),
            unused_groups_head: ptr::null_mut(),
            len: 0,
            capacity: 0,
            min_group_capacity: Self::default_min_block_capacity(),
            max_group_capacity: W::NONE.as_usize(),
            _owns: PhantomData,
        }
    }

    /// Creates an empty container with the given block-capacity limits.
    ///
    /// # Errors
    ///
    /// [`BroodError::LimitsOutOfRange`] if the limits fall outside
    /// [`Brood::block_capacity_hard_limits`] or `min > max`.
    pub fn with_limits(limits: Limits) -> Result<Self, BroodError> {
        Self::check_limits(limits)?;
        let mut brood = Self::new();
        brood.min_group_capacity = limits.min;
        brood.max_group_capacity = limits.max;
        Ok(brood)
    }

    fn check_limits(limits: Limits) -> Result<(), BroodError> {
        let hard = Self::block_capacity_hard_limits();
        if limits.min < hard.min || limits.min > limits.max || limits.max > hard.max {
            return Err(BroodError::LimitsOutOfRange {
                min: limits.min,
                max: limits.max,
                hard_min: hard.min,
                hard_max: hard.max,
            });
        }
        Ok(())
    }

    // A first block of 8 unless header overhead dominates tiny elements,
    // in which case the block is sized so elements outweigh the headers.
    fn default_min_block_capacity() -> usize {
        let overhead = 2 * (size_of::<Self>() + size_of::<Group<T, W>>());
        let per_slot = size_of::<Slot<T, W>>();
        let adaptive = if per_slot * 8 > overhead {
            8
        } else {
            overhead / per_slot
        };
        adaptive.clamp(3, W::NONE.as_usize())
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    /// Returns the number of live elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the container holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the total slot capacity across live blocks and the
    /// unused-block cache.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest supported element count for this element type.
    #[inline]
    pub fn max_len() -> usize {
        (isize::MAX as usize) / size_of::<Slot<T, W>>()
    }

    /// The active block-capacity limits.
    #[inline]
    pub fn block_capacity_limits(&self) -> Limits {
        Limits::new(self.min_group_capacity, self.max_group_capacity)
    }

    /// The hard block-capacity bounds for skipfield word type `W`:
    /// `[3, W::MAX]`.
    #[inline]
    pub fn block_capacity_hard_limits() -> Limits {
        Limits::new(3, W::NONE.as_usize())
    }

    /// Cursor at the first live element, equal to [`Brood::end`] when
    /// empty.
    #[inline]
    pub fn begin(&self) -> Cursor<T, W> {
        self.begin
    }

    /// Cursor one past the last live element.
    #[inline]
    pub fn end(&self) -> Cursor<T, W> {
        self.end
    }

    /// Iterates over the live elements. Order is unspecified.
    #[inline]
    pub fn iter(&self) -> Iter<'_, T, W> {
        Iter::new(self.begin, self.end, self.len)
    }

    /// Mutably iterates over the live elements.
    #[inline]
    pub fn iter_mut(&mut self) -> IterMut<'_, T, W> {
        IterMut::new(self.begin, self.end, self.len)
    }

    /// Recovers the cursor for an element from a pointer to it, scanning
    /// the block chain. O(blocks). Returns `None` for pointers that do
    /// not name a live element of this container.
    pub fn get_cursor(&self, element: *const T) -> Option<Cursor<T, W>> {
        if self.len == 0 {
            return None;
        }
        unsafe {
            // Last block first: usually the largest.
            let mut group = self.end.group;
            while !group.is_null() {
                let start = (*group).elements as usize;
                let finish = (*group).end_of_elements() as usize;
                let addr = element as usize;
                if addr >= start && addr < finish {
                    let byte_offset = addr - start;
                    if byte_offset % size_of::<Slot<T, W>>() != 0 {
                        return None;
                    }
                    let index = byte_offset / size_of::<Slot<T, W>>();
                    if (*group).elements.add(index) >= (*group).last_endpoint {
                        return None;
                    }
                    if (*(*group).skipfield.add(index)).as_usize() != 0 {
                        return None;
                    }
                    return Some(Cursor::at_index(group, index));
                }
                group = (*group).previous_group;
            }
        }
        None
    }

    /// Swaps the contents of two containers, limits included.
    #[inline]
    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(self, other);
    }

    // -------------------------------------------------------------------------
    // Insertion engine
    // -------------------------------------------------------------------------

    /// Inserts an element at an unspecified position and returns its
    /// cursor. Never invalidates other cursors or references.
    pub fn insert(&mut self, value: T) -> Cursor<T, W> {
        unsafe {
            if self.end.elem.is_null() {
                // First ever insertion: allocate the initial block.
                self.initialize(self.min_group_capacity);
                ptr::write(Slot::value_ptr(self.end.elem), value);
                self.end.elem = self.end.elem.add(1);
                self.end.skip = self.end.skip.add(1);
                self.len = 1;
                return self.begin;
            }
            if !self.erasure_groups_head.is_null() {
                return self.insert_into_free_slot(value);
            }
            let group = self.end.group;
            if self.end.elem != (*group).end_of_elements() {
                // Room at the tail.
                let cursor = self.end;
                ptr::write(Slot::value_ptr(self.end.elem), value);
                self.end.elem = self.end.elem.add(1);
                self.end.skip = self.end.skip.add(1);
                (*group).last_endpoint = self.end.elem;
                (*group).len += 1;
                self.len += 1;
                return cursor;
            }
            self.insert_into_new_tail(value)
        }
    }

    unsafe fn initialize(&mut self, capacity: usize) {
        unsafe {
            let group = Group::allocate(capacity, ptr::null_mut());
            self.end = Cursor::new(group, (*group).elements, (*group).skipfield);
        }
        self.begin = self.end;
        self.capacity += capacity;
    }

    unsafe fn insert_into_free_slot(&mut self, value: T) -> Cursor<T, W> {
        unsafe {
            let group = self.erasure_groups_head;
            let index = (*group).free_list_head.as_usize();
            let cursor = Cursor::at_index(group, index);
            let previous = (*Slot::node_ptr(cursor.elem)).prev;
            ptr::write(Slot::value_ptr(cursor.elem), value);
            self.reuse_skipblock_start(cursor, previous);
            cursor
        }
    }

    // Claims the head skipblock's first slot, which `value` has just been
    // written into. The skipblock either shrinks by one (its free-list
    // node moves forward a slot) or disappears.
    unsafe fn reuse_skipblock_start(&mut self, at: Cursor<T, W>, previous: W) {
        unsafe {
            let group = at.group;
            let remaining = (*at.skip).as_usize() - 1;

            if remaining != 0 {
                *at.skip.add(remaining) = W::from_usize(remaining);
                *at.skip.add(1) = W::from_usize(remaining);
                let new_head = (*group).free_list_head.as_usize() + 1;
                (*group).free_list_head = W::from_usize(new_head);
                if previous != W::NONE {
                    (*Slot::node_ptr((*group).elements.add(previous.as_usize()))).next =
                        W::from_usize(new_head);
                }
                let node = Slot::node_ptr(at.elem.add(1));
                (*node).prev = previous;
                (*node).next = W::NONE;
            } else {
                (*group).free_list_head = previous;
                if previous != W::NONE {
                    (*Slot::node_ptr((*group).elements.add(previous.as_usize()))).next = W::NONE;
                } else {
                    self.erasure_groups_head = (*group).erasures_list_next;
                }
            }

            *at.skip = W::ZERO;
            (*group).len += 1;
            self.len += 1;
            // The reused slot can precede the current begin position.
            if at.group == self.begin.group && at.elem < self.begin.elem {
                self.begin = at;
            }
        }
    }

    unsafe fn insert_into_new_tail(&mut self, value: T) -> Cursor<T, W> {
        unsafe {
            let next_group;
            if self.unused_groups_head.is_null() {
                let size = self
                    .len
                    .clamp(self.min_group_capacity, self.max_group_capacity);
                next_group = Group::allocate(size, self.end.group);
                ptr::write(Slot::value_ptr((*next_group).elements), value);
                self.capacity += size;
            } else {
                next_group = self.unused_groups_head;
                ptr::write(Slot::value_ptr((*next_group).elements), value);
                self.unused_groups_head = (*next_group).next_group;
                (*next_group).reset(
                    1,
                    ptr::null_mut(),
                    self.end.group,
                    (*self.end.group).group_number + 1,
                );
            }
            (*self.end.group).next_group = next_group;
            self.end.group = next_group;
            self.end.elem = (*next_group).last_endpoint;
            self.end.skip = (*next_group).skipfield.add(1);
            self.len += 1;
            Cursor::new(next_group, (*next_group).elements, (*next_group).skipfield)
        }
    }

    /// Inserts `count` clones of `value`.
    ///
    /// Reserves the full amount up front, then consumes reusable erased
    /// slots, the tail block's spare room, cached blocks and finally
    /// fresh blocks. If a clone panics mid-fill, the elements already
    /// built stay inserted and the container remains coherent.
    ///
    /// # Errors
    ///
    /// [`BroodError::CapacityExceeded`] if the resulting length would
    /// pass [`Brood::max_len`].
    pub fn insert_fill(&mut self, count: usize, value: T) -> Result<(), BroodError>
    where
        T: Clone,
    {
        if count == 0 {
            return Ok(());
        }
        if count == 1 {
            self.insert(value);
            return Ok(());
        }
        if self.len == 0 {
            return self.assign_fill(count, value);
        }
        let target = self.len.checked_add(count).ok_or(BroodError::CapacityExceeded {
            requested: usize::MAX,
            max: Self::max_len(),
        })?;
        self.reserve(target)?;
        let mut produce = || value.clone();
        unsafe { self.insert_bulk(&mut produce, count) };
        Ok(())
    }

    /// Inserts every element of `iter`.
    ///
    /// Iterators that report an exact size take the same batched path as
    /// [`Brood::insert_fill`]: reserve up front, then consume reusable
    /// skipblocks, the tail block's spare room, cached blocks and
    /// finally fresh blocks, with the same mid-fill panic recovery.
    /// Iterators without an exact size hint insert one element at a
    /// time. [`Extend`] and [`FromIterator`] delegate here.
    ///
    /// # Panics
    ///
    /// Panics if the iterator yields fewer elements than an exact size
    /// hint promised; elements already placed stay inserted.
    pub fn insert_from_iter<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut iter = iter.into_iter();
        let (lower, upper) = iter.size_hint();
        if lower > 1 && upper == Some(lower) {
            // Size hints are advisory, so a target that overflows or
            // fails to reserve routes to per-element insertion instead
            // of being trusted.
            if let Some(target) = self.len.checked_add(lower) {
                if self.reserve(target).is_ok() {
                    let mut produce = || match iter.next() {
                        Some(value) => value,
                        None => panic!("iterator shorter than its reported length"),
                    };
                    unsafe { self.insert_bulk(&mut produce, lower) };
                    // Anything past the reported size lands normally.
                    for value in iter {
                        self.insert(value);
                    }
                    return;
                }
            }
        }
        for value in iter {
            self.insert(value);
        }
    }

    /// Replaces the contents with `count` clones of `value`, reusing
    /// existing blocks where possible.
    ///
    /// # Errors
    ///
    /// [`BroodError::CapacityExceeded`] if `count > Brood::max_len()`.
    pub fn assign_fill(&mut self, count: usize, value: T) -> Result<(), BroodError>
    where
        T: Clone,
    {
        if count == 0 {
            self.reset();
            return Ok(());
        }
        if count > Self::max_len() {
            return Err(BroodError::CapacityExceeded {
                requested: count,
                max: Self::max_len(),
            });
        }
        unsafe {
            self.prepare_groups_for_assign(count);
            let mut produce = || value.clone();
            let first = self.begin.group;
            self.fill_groups_chain(&mut produce, count, 0, ptr::null_mut(), first);
        }
        Ok(())
    }

    /// Replaces the contents with the elements of an exactly-sized
    /// iterator, reusing existing blocks where possible.
    ///
    /// # Errors
    ///
    /// [`BroodError::CapacityExceeded`] if the iterator reports more
    /// elements than [`Brood::max_len`].
    ///
    /// # Panics
    ///
    /// Panics if the iterator yields fewer elements than its reported
    /// length; elements already placed stay inserted.
    pub fn assign_iter<I>(&mut self, iter: I) -> Result<(), BroodError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let mut iter = iter.into_iter();
        let count = iter.len();
        if count == 0 {
            self.reset();
            return Ok(());
        }
        if count > Self::max_len() {
            return Err(BroodError::CapacityExceeded {
                requested: count,
                max: Self::max_len(),
            });
        }
        unsafe {
            self.prepare_groups_for_assign(count);
            let mut produce = || match iter.next() {
                Some(value) => value,
                None => panic!("iterator shorter than its reported length"),
            };
            let first = self.begin.group;
            self.fill_groups_chain(&mut produce, count, 0, ptr::null_mut(), first);
        }
        Ok(())
    }

    // Core of the bulk-insert phases after the up-front reserve. `n >= 1`
    // and the first block exists (any prior reserve initializes it).
    unsafe fn insert_bulk(&mut self, produce: &mut impl FnMut() -> T, mut n: usize) {
        unsafe {
            // Phase 1: consume reusable skipblocks, newest block first.
            while !self.erasure_groups_head.is_null() {
                let group = self.erasure_groups_head;
                let head = (*group).free_list_head.as_usize();
                let start = Cursor::at_index(group, head);
                let run_len = (*start.skip).as_usize();
                let previous = (*Slot::node_ptr(start.elem)).prev;

                let restore_begin =
                    if group == self.begin.group && start.elem < self.begin.elem {
                        let old = self.begin;
                        self.begin = start;
                        Some(old)
                    } else {
                        None
                    };

                if run_len <= n {
                    // The whole skipblock is consumed.
                    (*group).free_list_head = previous;
                    self.fill_skipblock(produce, start, run_len, previous, restore_begin);
                    n -= run_len;
                    if (*group).free_list_head != W::NONE {
                        (*Slot::node_ptr(
                            (*group)
                                .elements
                                .add((*group).free_list_head.as_usize()),
                        ))
                        .next = W::NONE;
                    } else {
                        self.erasure_groups_head = (*group).erasures_list_next;
                    }
                    if n == 0 {
                        return;
                    }
                } else {
                    // Partial: the suffix stays a skipblock and keeps the
                    // free-list node, moved forward.
                    self.fill_skipblock(produce, start, n, previous, restore_begin);
                    let remaining = run_len - n;
                    *start.skip.add(n) = W::from_usize(remaining);
                    *start.skip.add(run_len - 1) = W::from_usize(remaining);
                    let new_head = head + n;
                    (*group).free_list_head = W::from_usize(new_head);
                    let node = Slot::node_ptr(start.elem.add(n));
                    (*node).prev = previous;
                    (*node).next = W::NONE;
                    if previous != W::NONE {
                        (*Slot::node_ptr((*group).elements.add(previous.as_usize()))).next =
                            W::from_usize(new_head);
                    }
                    return;
                }
            }

            // Phase 2: spare room in the tail block.
            let group = self.end.group;
            let tail_space = (*group).end_of_elements().offset_from(self.end.elem) as usize;
            let tail_fill = tail_space.min(n);
            if tail_fill != 0 {
                self.fill_at_end(produce, tail_fill);
                n -= tail_fill;
                if n == 0 {
                    return;
                }
            }

            // Phase 3: cached blocks, already sized by the reserve.
            (*self.end.group).next_group = self.unused_groups_head;
            let previous = self.end.group;
            let chain = (*previous).next_group;
            self.fill_groups_chain(produce, n, (*previous).group_number + 1, previous, chain);
        }
    }

    // Fills whole blocks from `current` onwards, ending with a partial
    // fill. Blocks arrive linked through `next_group`; each is reset as
    // it is claimed. Used by bulk insert (previous = tail block) and
    // assign (previous = null, current = first block).
    unsafe fn fill_groups_chain(
        &mut self,
        produce: &mut impl FnMut() -> T,
        mut n: usize,
        mut group_number: usize,
        mut previous: *mut Group<T, W>,
        mut current: *mut Group<T, W>,
    ) {
        unsafe {
            loop {
                let capacity = (*current).capacity;
                if capacity >= n {
                    break;
                }
                (*current).reset(0, (*current).next_group, previous, group_number);
                group_number += 1;
                self.end = Cursor::new(current, (*current).elements, (*current).skipfield);
                self.fill_at_end(produce, capacity);
                previous = current;
                n -= capacity;
                current = (*current).next_group;
            }
            // Final block: partial (or exact) fill.
            self.unused_groups_head = (*current).next_group;
            (*current).reset(0, ptr::null_mut(), previous, group_number);
            self.end = Cursor::new(current, (*current).elements, (*current).skipfield);
            self.fill_at_end(produce, n);
        }
    }

    // Constructs `n` elements at the tail cursor, which must have `n`
    // slots of room. On success the tail block's bookkeeping advances by
    // `n`; if `produce` panics, the guard commits the prefix already
    // built instead.
    unsafe fn fill_at_end(&mut self, produce: &mut impl FnMut() -> T, n: usize) {
        unsafe {
            let mut guard = TailFillGuard {
                brood: self,
                constructed: 0,
            };
            while guard.constructed < n {
                let value = produce();
                let end = &mut guard.brood.end;
                ptr::write(Slot::value_ptr(end.elem), value);
                end.elem = end.elem.add(1);
                guard.constructed += 1;
            }
            mem::forget(guard);
            let group = self.end.group;
            (*group).last_endpoint = self.end.elem;
            (*group).len += n;
            self.end.skip = self.end.skip.add(n);
            self.len += n;
        }
    }

    // Constructs `n <= run length` elements into a skipblock starting at
    // `start`. The caller has already read the block's free-list node
    // (`previous`) and handles the free-list head afterwards; the guard
    // re-threads a correct suffix skipblock if `produce` panics.
    unsafe fn fill_skipblock(
        &mut self,
        produce: &mut impl FnMut() -> T,
        start: Cursor<T, W>,
        n: usize,
        previous: W,
        restore_begin: Option<Cursor<T, W>>,
    ) {
        unsafe {
            let run_len = (*start.skip).as_usize();
            debug_assert!(n <= run_len);
            let mut guard = SkipblockFillGuard {
                brood: self,
                start,
                previous,
                run_len,
                restore_begin,
                constructed: 0,
            };
            while guard.constructed < n {
                let value = produce();
                ptr::write(Slot::value_ptr(start.elem.add(guard.constructed)), value);
                guard.constructed += 1;
            }
            mem::forget(guard);
            ptr::write_bytes(start.skip, 0, n);
            (*start.group).len += n;
            self.len += n;
        }
    }

    // -------------------------------------------------------------------------
    // Erasure engine
    // -------------------------------------------------------------------------

    /// Erases the element at `at`, returning the cursor of the next live
    /// element (or [`Brood::end`]). Only cursors to the erased element are
    /// invalidated.
    ///
    /// # Safety
    ///
    /// `at` must point at a live element of this container.
    pub unsafe fn erase(&mut self, at: Cursor<T, W>) -> Cursor<T, W> {
        unsafe {
            debug_assert!(self.len != 0);
            debug_assert!(!at.group.is_null());
            debug_assert!(at.elem != (*at.group).last_endpoint, "cursor at end position");
            debug_assert!((*at.skip).as_usize() == 0, "cursor at erased slot");

            ptr::drop_in_place(Slot::value_ptr(at.elem));
            self.len -= 1;

            let group = at.group;
            (*group).len -= 1;

            if (*group).len != 0 {
                return self.erase_update_skipfield(at);
            }

            // Block drained: retire it.
            let is_tail = (*group).next_group.is_null();
            let is_head = group == self.begin.group;

            if is_head && is_tail {
                // Only block: keep it, wipe its state.
                self.reset_only_group_left(group);
                self.end
            } else if is_head {
                let next_group = (*group).next_group;
                (*next_group).previous_group = ptr::null_mut();
                Self::renumber_from(next_group);
                if (*group).has_free_list() {
                    self.remove_from_erasure_groups(group);
                }
                self.capacity -= (*group).capacity;
                Group::deallocate(group);
                self.begin = Cursor::first_live_of(next_group);
                self.begin
            } else if !is_tail {
                let next_group = (*group).next_group;
                (*next_group).previous_group = (*group).previous_group;
                (*(*group).previous_group).next_group = next_group;
                Self::renumber_from(next_group);
                if (*group).has_free_list() {
                    self.remove_from_erasure_groups(group);
                }
                if next_group != self.end.group {
                    self.capacity -= (*group).capacity;
                    Group::deallocate(group);
                } else {
                    // The block right before the tail: keep it warm.
                    self.cache_unused_group(group);
                }
                Cursor::first_live_of(next_group)
            } else {
                if (*group).has_free_list() {
                    self.remove_from_erasure_groups(group);
                }
                let previous = (*group).previous_group;
                (*previous).next_group = ptr::null_mut();
                self.end.group = previous;
                self.end.elem = (*previous).end_of_elements();
                self.end.skip = (*previous).skipfield.add((*previous).capacity);
                self.cache_unused_group(group);
                self.end
            }
        }
    }

    // The four skipfield cases for erasing inside a block that keeps
    // other live elements: no erased neighbour, left only, right only,
    // both. Returns the next-live cursor.
    unsafe fn erase_update_skipfield(&mut self, at: Cursor<T, W>) -> Cursor<T, W> {
        unsafe {
            let group = at.group;
            let prev_erased =
                at.skip != (*group).skipfield && (*at.skip.sub(1)).as_usize() != 0;
            let next_erased = (*at.skip.add(1)).as_usize() != 0;
            let mut update_value = 1usize;

            match (prev_erased, next_erased) {
                (false, false) => {
                    // Lone erasure: new length-1 skipblock, pushed onto
                    // the free list.
                    *at.skip = W::from_usize(1);
                    let index = at.elem.offset_from((*group).elements) as usize;
                    if (*group).has_free_list() {
                        (*Slot::node_ptr(
                            (*group).elements.add((*group).free_list_head.as_usize()),
                        ))
                        .next = W::from_usize(index);
                    } else {
                        (*group).erasures_list_next = self.erasure_groups_head;
                        self.erasure_groups_head = group;
                    }
                    let node = Slot::node_ptr(at.elem);
                    (*node).prev = (*group).free_list_head;
                    (*node).next = W::NONE;
                    (*group).free_list_head = W::from_usize(index);
                }
                (true, false) => {
                    // Extend the left run by one; its node is untouched.
                    let left = (*at.skip.sub(1)).as_usize();
                    let joined = left + 1;
                    *at.skip.sub(left) = W::from_usize(joined);
                    *at.skip = W::from_usize(joined);
                }
                (false, true) => {
                    // Absorb the right run; its node moves back one slot.
                    let following = (*at.skip.add(1)).as_usize() + 1;
                    *at.skip.add(following - 1) = W::from_usize(following);
                    *at.skip = W::from_usize(following);

                    let next_node = Slot::node_ptr(at.elem.add(1));
                    let node_prev = (*next_node).prev;
                    let node_next = (*next_node).next;
                    let node = Slot::node_ptr(at.elem);
                    (*node).prev = node_prev;
                    (*node).next = node_next;

                    let index = at.elem.offset_from((*group).elements) as usize;
                    if node_prev != W::NONE {
                        (*Slot::node_ptr((*group).elements.add(node_prev.as_usize()))).next =
                            W::from_usize(index);
                    }
                    if node_next != W::NONE {
                        (*Slot::node_ptr((*group).elements.add(node_next.as_usize()))).prev =
                            W::from_usize(index);
                    } else {
                        (*group).free_list_head = W::from_usize(index);
                    }
                    update_value = following;
                }
                (true, true) => {
                    // Join both runs; the right run's node is unlinked.
                    let preceding = (*at.skip.sub(1)).as_usize();
                    let following = (*at.skip.add(1)).as_usize() + 1;
                    *at.skip.sub(preceding) = W::from_usize(preceding + following);
                    *at.skip.add(following - 1) = W::from_usize(preceding + following);

                    let next_node = Slot::node_ptr(at.elem.add(1));
                    let node_prev = (*next_node).prev;
                    let node_next = (*next_node).next;
                    if node_prev != W::NONE {
                        (*Slot::node_ptr((*group).elements.add(node_prev.as_usize()))).next =
                            node_next;
                    }
                    if node_next != W::NONE {
                        (*Slot::node_ptr((*group).elements.add(node_next.as_usize()))).prev =
                            node_prev;
                    } else {
                        (*group).free_list_head = node_prev;
                    }
                    update_value = following;
                }
            }

            let mut next = Cursor::new(
                group,
                at.elem.add(update_value),
                at.skip.add(update_value),
            );
            if next.elem == (*group).last_endpoint && !(*group).next_group.is_null() {
                next = Cursor::first_live_of((*group).next_group);
            }
            if at.elem == self.begin.elem {
                self.begin = next;
            }
            next
        }
    }

    /// Erases the range `[first, last)`, returning a cursor to the
    /// element past the erased range.
    ///
    /// # Safety
    ///
    /// Both cursors must point at live elements (or the end position) of
    /// this container, with `first` not after `last`.
    pub unsafe fn erase_range(
        &mut self,
        first: Cursor<T, W>,
        last: Cursor<T, W>,
    ) -> Cursor<T, W> {
        unsafe {
            let mut current = first;

            if first.group != last.group {
                // Head block: erase the partial span [first, block end)
                // unless `first` is the block's first live element, in
                // which case the whole block is handled as interior.
                if first.elem
                    != (*first.group).elements.add((*first.group).leading_skip())
                {
                    let group = first.group;
                    let region_end = (*group).last_endpoint;
                    let destroyed = self.destroy_span(group, &mut current, region_end);

                    // Install one merged skipblock over [first, block end).
                    let to_end = region_end.offset_from(first.elem) as usize;
                    let previous_value = (*first.skip.sub(1)).as_usize();
                    if previous_value == 0 {
                        *first.skip = W::from_usize(to_end);
                        *first.skip.add(to_end - 1) = W::from_usize(to_end);
                        let index = first.elem.offset_from((*group).elements) as usize;
                        if (*group).has_free_list() {
                            (*Slot::node_ptr(
                                (*group).elements.add((*group).free_list_head.as_usize()),
                            ))
                            .next = W::from_usize(index);
                        } else {
                            (*group).erasures_list_next = self.erasure_groups_head;
                            self.erasure_groups_head = group;
                        }
                        let node = Slot::node_ptr(first.elem);
                        (*node).prev = (*group).free_list_head;
                        (*node).next = W::NONE;
                        (*group).free_list_head = W::from_usize(index);
                    } else {
                        // Merge into the preceding run.
                        *first.skip.sub(previous_value) =
                            W::from_usize(previous_value + to_end);
                        *first.skip.add(to_end - 1) =
                            W::from_usize(previous_value + to_end);
                    }

                    (*group).len -= destroyed;
                    self.len -= destroyed;
                    current.group = (*group).next_group;
                }

                // Interior blocks are consumed whole.
                let previous_group = (*current.group).previous_group;
                while current.group != last.group {
                    let group = current.group;
                    if mem::needs_drop::<T>() {
                        let mut walk = Cursor::first_live_of(group);
                        let region_end = (*group).last_endpoint;
                        loop {
                            ptr::drop_in_place(Slot::value_ptr(walk.elem));
                            walk.skip = walk.skip.add(1);
                            let hop = (*walk.skip).as_usize();
                            walk.elem = walk.elem.add(hop + 1);
                            walk.skip = walk.skip.add(hop);
                            if walk.elem == region_end {
                                break;
                            }
                        }
                    }
                    if (*group).has_free_list() {
                        self.remove_from_erasure_groups(group);
                    }
                    self.len -= (*group).len;
                    current.group = (*group).next_group;
                    if group != self.end.group && (*group).next_group != self.end.group {
                        self.capacity -= (*group).capacity;
                        Group::deallocate(group);
                    } else {
                        self.cache_unused_group(group);
                    }
                }

                current = Cursor::first_live_of(last.group);
                (*last.group).previous_group = previous_group;
                if !previous_group.is_null() {
                    (*previous_group).next_group = last.group;
                } else {
                    // Everything before this block is gone.
                    self.begin = last;
                }
            }

            if current.elem == last.elem {
                // Covers the empty range and ranges ending at a block's
                // first live element.
                return last;
            }

            // Final block.
            if last.elem != self.end.elem
                || current.elem
                    != (*current.group).elements.add((*current.group).leading_skip())
            {
                // Partial erase: `last` (exclusive) stays live, so the
                // block survives.
                let group = last.group;
                let span_start = current;
                let destroyed = self.destroy_span(group, &mut current, last.elem);

                let span = last.elem.offset_from(span_start.elem) as usize;
                let index = span_start.elem.offset_from((*group).elements) as usize;
                if index == 0 || (*span_start.skip.sub(1)).as_usize() == 0 {
                    *span_start.skip = W::from_usize(span);
                    *last.skip.sub(1) = W::from_usize(span);
                    if (*group).has_free_list() {
                        (*Slot::node_ptr(
                            (*group).elements.add((*group).free_list_head.as_usize()),
                        ))
                        .next = W::from_usize(index);
                    } else {
                        (*group).erasures_list_next = self.erasure_groups_head;
                        self.erasure_groups_head = group;
                    }
                    let node = Slot::node_ptr(span_start.elem);
                    (*node).prev = (*group).free_list_head;
                    (*node).next = W::NONE;
                    (*group).free_list_head = W::from_usize(index);
                } else {
                    let previous_value = (*span_start.skip.sub(1)).as_usize();
                    *span_start.skip.sub(previous_value) =
                        W::from_usize(previous_value + span);
                    *last.skip.sub(1) = W::from_usize(previous_value + span);
                }

                if first.elem == self.begin.elem {
                    self.begin = last;
                }
                (*group).len -= destroyed;
                self.len -= destroyed;
            } else {
                // The block's whole live span goes, through to `end`.
                let group = current.group;
                if mem::needs_drop::<T>() {
                    let mut walk = current;
                    while walk.elem != last.elem {
                        ptr::drop_in_place(Slot::value_ptr(walk.elem));
                        walk.skip = walk.skip.add(1);
                        let hop = (*walk.skip).as_usize();
                        walk.elem = walk.elem.add(hop + 1);
                        walk.skip = walk.skip.add(hop);
                    }
                }
                self.len -= (*group).len;
                if self.len == 0 {
                    self.reset_only_group_left(group);
                    return self.end;
                }
                // Other blocks keep the container alive, so this drained
                // block is the tail.
                if (*group).has_free_list() {
                    self.remove_from_erasure_groups(group);
                }
                let previous = (*group).previous_group;
                (*previous).next_group = ptr::null_mut();
                self.end.group = previous;
                self.end.elem = (*previous).end_of_elements();
                self.end.skip = (*previous).skipfield.add((*previous).capacity);
                self.cache_unused_group(group);
                return self.end;
            }

            last
        }
    }

    // Destroys the live elements in [cursor, region_end) of `group`,
    // unthreading every skipblock met along the way from the block's
    // free list. Returns the number of elements destroyed.
    unsafe fn destroy_span(
        &mut self,
        group: *mut Group<T, W>,
        cursor: &mut Cursor<T, W>,
        region_end: *mut Slot<T, W>,
    ) -> usize {
        unsafe {
            if !mem::needs_drop::<T>() && !(*group).has_free_list() {
                let destroyed = region_end.offset_from(cursor.elem) as usize;
                cursor.elem = region_end;
                cursor.skip = cursor.skip.add(destroyed);
                return destroyed;
            }

            let mut destroyed = 0;
            while cursor.elem != region_end {
                if (*cursor.skip).as_usize() == 0 {
                    if mem::needs_drop::<T>() {
                        ptr::drop_in_place(Slot::value_ptr(cursor.elem));
                    }
                    destroyed += 1;
                    cursor.elem = cursor.elem.add(1);
                    cursor.skip = cursor.skip.add(1);
                } else {
                    let node = Slot::node_ptr(cursor.elem);
                    let node_prev = (*node).prev;
                    let node_next = (*node).next;
                    let run = (*cursor.skip).as_usize();
                    cursor.elem = cursor.elem.add(run);
                    cursor.skip = cursor.skip.add(run);

                    if node_next == W::NONE && node_prev == W::NONE {
                        // That was the block's only skipblock: all
                        // remaining slots in the region are live.
                        self.remove_from_erasure_groups(group);
                        (*group).free_list_head = W::NONE;
                        destroyed += region_end.offset_from(cursor.elem) as usize;
                        if mem::needs_drop::<T>() {
                            while cursor.elem != region_end {
                                ptr::drop_in_place(Slot::value_ptr(cursor.elem));
                                cursor.elem = cursor.elem.add(1);
                                cursor.skip = cursor.skip.add(1);
                            }
                        } else {
                            let rest = region_end.offset_from(cursor.elem) as usize;
                            cursor.elem = region_end;
                            cursor.skip = cursor.skip.add(rest);
                        }
                        break;
                    } else if node_next == W::NONE {
                        (*group).free_list_head = node_prev;
                        (*Slot::node_ptr((*group).elements.add(node_prev.as_usize()))).next =
                            W::NONE;
                    } else {
                        (*Slot::node_ptr((*group).elements.add(node_next.as_usize()))).prev =
                            node_prev;
                        if node_prev != W::NONE {
                            (*Slot::node_ptr((*group).elements.add(node_prev.as_usize())))
                                .next = node_next;
                        }
                    }
                }
            }
            destroyed
        }
    }

    /// Erases every element matching `predicate`, batching adjacent
    /// matches into range erasures. Returns the number erased.
    pub fn erase_if<F: FnMut(&T) -> bool>(&mut self, mut predicate: F) -> usize {
        unsafe {
            let mut removed = 0;
            let mut cursor = self.begin;
            while cursor != self.end {
                if predicate(cursor.as_ref()) {
                    let run_start = cursor;
                    let mut run_len = 1;
                    let mut run_end = cursor;
                    run_end.step_forward();
                    while run_end != self.end && predicate(run_end.as_ref()) {
                        run_len += 1;
                        run_end.step_forward();
                    }
                    removed += run_len;
                    cursor = if run_len == 1 {
                        self.erase(run_start)
                    } else {
                        self.erase_range(run_start, run_end)
                    };
                } else {
                    cursor.step_forward();
                }
            }
            removed
        }
    }

    /// Erases every element equal to `value`. Returns the number erased.
    pub fn erase_value(&mut self, value: &T) -> usize
    where
        T: PartialEq,
    {
        self.erase_if(|x| x == value)
    }

    // -------------------------------------------------------------------------
    // Bulk operations
    // -------------------------------------------------------------------------

    /// Destroys all elements. All blocks except the first move to the
    /// unused-block cache; capacity is retained.
    pub fn clear(&mut self) {
        if self.len == 0 {
            return;
        }
        unsafe {
            if mem::needs_drop::<T>() {
                let mut cursor = self.begin;
                while cursor != self.end {
                    ptr::drop_in_place(Slot::value_ptr(cursor.elem));
                    cursor.step_forward();
                }
            }
            if self.begin.group != self.end.group {
                (*self.end.group).next_group = self.unused_groups_head;
                self.unused_groups_head = (*self.begin.group).next_group;
                self.end.group = self.begin.group;
            }
            self.reset_only_group_left(self.begin.group);
            self.len = 0;
        }
    }

    /// Destroys all elements and deallocates every block, including the
    /// unused cache. Capacity drops to zero; limits are kept.
    pub fn reset(&mut self) {
        unsafe {
            self.destroy_all_data();
        }
        self.blank();
    }

    /// Ensures `capacity() >= new_capacity` by allocating blocks into the
    /// unused cache (mostly maximum-sized, plus one remainder block).
    ///
    /// # Errors
    ///
    /// [`BroodError::CapacityExceeded`] if the target passes
    /// [`Brood::max_len`].
    pub fn reserve(&mut self, new_capacity: usize) -> Result<(), BroodError> {
        if new_capacity <= self.capacity {
            return Ok(());
        }
        if new_capacity > Self::max_len() {
            return Err(BroodError::CapacityExceeded {
                requested: new_capacity,
                max: Self::max_len(),
            });
        }
        unsafe {
            self.grow_reserve(new_capacity);
        }
        Ok(())
    }

    /// Deallocates every block in the unused cache, reducing capacity.
    pub fn trim(&mut self) {
        unsafe {
            while !self.unused_groups_head.is_null() {
                let next = (*self.unused_groups_head).next_group;
                self.capacity -= (*self.unused_groups_head).capacity;
                Group::deallocate(self.unused_groups_head);
                self.unused_groups_head = next;
            }
        }
    }

    /// Rebuilds the container into exactly-sized storage by moving every
    /// element. Invalidates all cursors and references.
    pub fn shrink_to_fit(&mut self) {
        if self.len == 0 {
            self.reset();
        } else if self.len != self.capacity {
            unsafe {
                self.consolidate();
            }
        }
    }

    /// Installs new block-capacity limits. If an existing block violates
    /// them, the container is consolidated (invalidating cursors and
    /// references); otherwise nothing else changes.
    ///
    /// # Errors
    ///
    /// [`BroodError::LimitsOutOfRange`] as for [`Brood::with_limits`];
    /// the container is unchanged on error.
    pub fn reshape(&mut self, limits: Limits) -> Result<(), BroodError> {
        Self::check_limits(limits)?;
        self.min_group_capacity = limits.min;
        self.max_group_capacity = limits.max;
        unsafe {
            let mut violated = false;
            let mut group = self.begin.group;
            while !group.is_null() {
                if (*group).capacity < limits.min || (*group).capacity > limits.max {
                    violated = true;
                    break;
                }
                group = (*group).next_group;
            }
            if !violated {
                let mut group = self.unused_groups_head;
                while !group.is_null() {
                    if (*group).capacity < limits.min || (*group).capacity > limits.max {
                        violated = true;
                        break;
                    }
                    group = (*group).next_group;
                }
            }
            if violated {
                if self.len == 0 {
                    self.reset();
                } else {
                    self.consolidate();
                }
            }
        }
        Ok(())
    }

    /// Moves every element of `other` into `self` in O(1), leaving
    /// `other` empty. Cursors and references into both containers remain
    /// valid (iteration order is merged, not interleaved).
    ///
    /// # Errors
    ///
    /// [`BroodError::IncompatibleBlockCapacity`] if a donor block's
    /// capacity violates the receiving container's limits. Both
    /// containers are unchanged on error.
    pub fn splice(&mut self, other: &mut Self) -> Result<(), BroodError> {
        if other.len == 0 {
            return Ok(());
        }
        unsafe {
            if self.len == 0 {
                // Adopt the donor's storage and limits wholesale.
                self.destroy_all_data();
                self.end = other.end;
                self.begin = other.begin;
                self.erasure_groups_head = other.erasure_groups_head;
                self.unused_groups_head = other.unused_groups_head;
                self.len = other.len;
                self.capacity = other.capacity;
                self.min_group_capacity = other.min_group_capacity;
                self.max_group_capacity = other.max_group_capacity;
                other.blank();
                return Ok(());
            }

            // The container with the larger tail hole becomes the front
            // of the result, so fewer slots turn into a skipblock.
            let self_hole = (*self.end.group).end_of_elements().offset_from(self.end.elem);
            let other_hole = (*other.end.group)
                .end_of_elements()
                .offset_from(other.end.elem);
            let swap_roles = self_hole > other_hole;

            // Validate before mutating either side.
            let (dst_min, dst_max, src_limits, src_begin) = if swap_roles {
                (
                    other.min_group_capacity,
                    other.max_group_capacity,
                    self.block_capacity_limits(),
                    self.begin.group,
                )
            } else {
                (
                    self.min_group_capacity,
                    self.max_group_capacity,
                    other.block_capacity_limits(),
                    other.begin.group,
                )
            };
            if src_limits.min < dst_min || src_limits.max > dst_max {
                let mut group = src_begin;
                while !group.is_null() {
                    if (*group).capacity < dst_min || (*group).capacity > dst_max {
                        return Err(BroodError::IncompatibleBlockCapacity {
                            capacity: (*group).capacity,
                            min: dst_min,
                            max: dst_max,
                        });
                    }
                    group = (*group).next_group;
                }
            }

            if swap_roles {
                mem::swap(self, other);
            }

            // Append the donor's erasure-block list.
            if !other.erasure_groups_head.is_null() {
                if !self.erasure_groups_head.is_null() {
                    let mut tail = self.erasure_groups_head;
                    while !(*tail).erasures_list_next.is_null() {
                        tail = (*tail).erasures_list_next;
                    }
                    (*tail).erasures_list_next = other.erasure_groups_head;
                } else {
                    self.erasure_groups_head = other.erasure_groups_head;
                }
            }

            // Convert the receiving tail block's trailing hole into a
            // skipblock so iteration can cross it.
            let group = self.end.group;
            let hole = (*group).end_of_elements().offset_from(self.end.elem) as usize;
            if hole != 0 {
                let previous_value = (*self.end.skip.sub(1)).as_usize();
                (*group).last_endpoint = (*group).end_of_elements();
                if previous_value == 0 {
                    *self.end.skip = W::from_usize(hole);
                    *self.end.skip.add(hole - 1) = W::from_usize(hole);
                    let index = self.end.elem.offset_from((*group).elements) as usize;
                    if (*group).has_free_list() {
                        (*Slot::node_ptr(
                            (*group).elements.add((*group).free_list_head.as_usize()),
                        ))
                        .next = W::from_usize(index);
                    } else {
                        (*group).erasures_list_next = self.erasure_groups_head;
                        self.erasure_groups_head = group;
                    }
                    let node = Slot::node_ptr(self.end.elem);
                    (*node).prev = (*group).free_list_head;
                    (*node).next = W::NONE;
                    (*group).free_list_head = W::from_usize(index);
                } else {
                    *self.end.skip.sub(previous_value) =
                        W::from_usize(previous_value + hole);
                    *self.end.skip.add(hole - 1) = W::from_usize(previous_value + hole);
                }
            }

            // Renumber the donor blocks to continue the receiver's
            // ordinals, then join the chains.
            let mut number = (*self.end.group).group_number;
            let mut donor = other.begin.group;
            while !donor.is_null() {
                number += 1;
                (*donor).group_number = number;
                donor = (*donor).next_group;
            }
            (*self.end.group).next_group = other.begin.group;
            (*other.begin.group).previous_group = self.end.group;
            self.end = other.end;
            self.len += other.len;

            // The donor's unused cache is not transferred.
            other.trim();
            self.capacity += other.capacity;
            other.blank();
            Ok(())
        }
    }

    /// Sorts the elements in place by `compare`.
    ///
    /// Cursors and pointers stay valid but the values they refer to are
    /// permuted. O(n log n) comparisons, O(n) moves via a parallel
    /// pointer array and cycle-walking.
    pub fn sort_by<F: FnMut(&T, &T) -> Ordering>(&mut self, mut compare: F) {
        if self.len < 2 {
            return;
        }
        let mut positions: Vec<(*mut T, usize)> = Vec::with_capacity(self.len);
        unsafe {
            let mut cursor = self.begin;
            let mut index = 0;
            while cursor != self.end {
                positions.push((Slot::value_ptr(cursor.elem), index));
                index += 1;
                cursor.step_forward();
            }
        }

        // The pointers stay valid for the whole sort: nothing moves
        // until the permutation pass below.
        positions.sort_unstable_by(|a, b| compare(unsafe { &*a.0 }, unsafe { &*b.0 }));

        // Realise the permutation with one displaced value per cycle.
        unsafe {
            for index in 0..positions.len() {
                if positions[index].1 != index {
                    let displaced = ptr::read(positions[index].0);
                    let mut destination = index;
                    let mut source = positions[index].1;
                    loop {
                        ptr::copy_nonoverlapping(positions[source].0, positions[destination].0, 1);
                        destination = source;
                        source = positions[destination].1;
                        positions[destination].1 = destination;
                        if source == index {
                            break;
                        }
                    }
                    ptr::write(positions[destination].0, displaced);
                }
            }
        }
    }

    /// Sorts the elements in place. See [`Brood::sort_by`].
    pub fn sort(&mut self)
    where
        T: Ord,
    {
        self.sort_by(T::cmp);
    }

    /// Erases all but the first of each run of adjacent elements matching
    /// `equal`. Returns the number erased.
    pub fn unique_by<F: FnMut(&T, &T) -> bool>(&mut self, mut equal: F) -> usize {
        if self.len < 2 {
            return 0;
        }
        unsafe {
            let mut removed = 0;
            let mut previous = self.begin;
            let mut cursor = previous;
            cursor.step_forward();
            while cursor != self.end {
                if equal(cursor.as_ref(), previous.as_ref()) {
                    let run_start = cursor;
                    let mut run_len = 1;
                    let mut run_end = cursor;
                    run_end.step_forward();
                    while run_end != self.end && equal(run_end.as_ref(), previous.as_ref()) {
                        run_len += 1;
                        run_end.step_forward();
                    }
                    removed += run_len;
                    cursor = if run_len == 1 {
                        self.erase(run_start)
                    } else {
                        self.erase_range(run_start, run_end)
                    };
                } else {
                    previous = cursor;
                    cursor.step_forward();
                }
            }
            removed
        }
    }

    /// Erases adjacent duplicates. See [`Brood::unique_by`].
    pub fn unique(&mut self) -> usize
    where
        T: PartialEq,
    {
        self.unique_by(|a, b| a == b)
    }

    // -------------------------------------------------------------------------
    // Internal: chain maintenance
    // -------------------------------------------------------------------------

    unsafe fn renumber_from(mut group: *mut Group<T, W>) {
        unsafe {
            while !group.is_null() {
                (*group).group_number -= 1;
                group = (*group).next_group;
            }
        }
    }

    unsafe fn remove_from_erasure_groups(&mut self, target: *mut Group<T, W>) {
        unsafe {
            if target == self.erasure_groups_head {
                self.erasure_groups_head = (*target).erasures_list_next;
                return;
            }
            let mut previous = self.erasure_groups_head;
            let mut current = (*previous).erasures_list_next;
            while current != target {
                previous = current;
                current = (*current).erasures_list_next;
            }
            (*previous).erasures_list_next = (*current).erasures_list_next;
        }
    }

    unsafe fn reset_only_group_left(&mut self, group: *mut Group<T, W>) {
        unsafe {
            self.erasure_groups_head = ptr::null_mut();
            (*group).reset(0, ptr::null_mut(), ptr::null_mut(), 0);
            self.begin = Cursor::new(group, (*group).elements, (*group).skipfield);
            self.end = self.begin;
        }
    }

    unsafe fn cache_unused_group(&mut self, group: *mut Group<T, W>) {
        unsafe {
            (*group).next_group = self.unused_groups_head;
        }
        self.unused_groups_head = group;
    }

    // Allocates blocks into the unused cache until `capacity >= target`.
    // The caller has validated `target` against `max_len`.
    unsafe fn grow_reserve(&mut self, target: usize) {
        unsafe {
            let additional = target - self.capacity;
            let max = self.max_group_capacity;
            let mut full_groups = additional / max;
            let mut remainder = additional - full_groups * max;
            if remainder == 0 {
                remainder = max;
                full_groups -= 1;
            } else if remainder < self.min_group_capacity {
                remainder = self.min_group_capacity;
            }

            let mut current: *mut Group<T, W>;
            let first_unused: *mut Group<T, W>;

            if self.begin.group.is_null() {
                // The remainder block becomes the (empty) first block.
                self.initialize(remainder);
                let group = self.begin.group;
                (*group).last_endpoint = (*group).elements;
                (*group).len = 0;
                if full_groups == 0 {
                    return;
                }
                current = Group::allocate(max, group);
                first_unused = current;
                self.capacity += max;
                full_groups -= 1;
            } else {
                current = Group::allocate(remainder, self.end.group);
                first_unused = current;
                self.capacity += remainder;
            }

            while full_groups != 0 {
                let next = Group::allocate(max, current);
                (*current).next_group = next;
                current = next;
                self.capacity += max;
                full_groups -= 1;
            }
            (*current).next_group = self.unused_groups_head;
            self.unused_groups_head = first_unused;
        }
    }

    // Destroys all current elements and reorganises the block chain to
    // receive `count` replacement elements: surplus small blocks are
    // released, missing capacity is reserved, and every block ends up on
    // one `next_group` chain starting at `begin.group`.
    unsafe fn prepare_groups_for_assign(&mut self, count: usize) {
        unsafe {
            if mem::needs_drop::<T>() {
                let mut cursor = self.begin;
                while cursor != self.end {
                    ptr::drop_in_place(Slot::value_ptr(cursor.elem));
                    cursor.step_forward();
                }
            }

            if count < self.capacity && self.capacity - count >= self.min_group_capacity {
                let mut difference = self.capacity - count;
                (*self.end.group).next_group = self.unused_groups_head;

                // Release surplus blocks that fit under the difference.
                let mut current = self.begin.group;
                let mut previous: *mut Group<T, W> = ptr::null_mut();
                loop {
                    let next = (*current).next_group;
                    if (*current).capacity <= difference {
                        difference -= (*current).capacity;
                        self.capacity -= (*current).capacity;
                        if current == self.begin.group {
                            self.begin.group = next;
                        }
                        Group::deallocate(current);
                    } else {
                        if !previous.is_null() {
                            (*previous).next_group = current;
                        }
                        previous = current;
                    }
                    if next.is_null() {
                        break;
                    }
                    current = next;
                }
                (*previous).next_group = ptr::null_mut();
            } else {
                if count > self.capacity {
                    self.grow_reserve(count);
                }
                (*self.end.group).next_group = self.unused_groups_head;
            }

            self.begin.elem = (*self.begin.group).elements;
            self.begin.skip = (*self.begin.group).skipfield;
            self.erasure_groups_head = ptr::null_mut();
            self.len = 0;
        }
    }

    // Moves every element into freshly-sized storage and swaps it in.
    // The one operation (besides reset) that invalidates cursors.
    unsafe fn consolidate(&mut self) {
        unsafe {
            let limits = self.block_capacity_limits();
            let mut fresh = Self::new();
            fresh.min_group_capacity = limits.min;
            fresh.max_group_capacity = limits.max;
            fresh.grow_reserve(self.len);
            let mut cursor = self.begin;
            while cursor != self.end {
                fresh.insert(ptr::read(Slot::value_ptr(cursor.elem)));
                cursor.step_forward();
            }
            // The values moved out; release the old blocks raw.
            self.len = 0;
            mem::swap(self, &mut fresh);
        }
    }

    fn blank(&mut self) {
        self.end = Cursor::null();
        self.begin = Cursor::null();
        self.erasure_groups_head = ptr::null_mut();
        self.unused_groups_head = ptr::null_mut();
        self.len = 0;
        self.capacity = 0;
    }

    pub(crate) unsafe fn destroy_all_data(&mut self) {
        unsafe {
            if self.begin.group.is_null() {
                debug_assert!(self.unused_groups_head.is_null());
                return;
            }
            (*self.end.group).next_group = self.unused_groups_head;

            if mem::needs_drop::<T>() && self.len != 0 {
                let mut cursor = self.begin;
                loop {
                    let region_end = (*cursor.group).last_endpoint;
                    loop {
                        ptr::drop_in_place(Slot::value_ptr(cursor.elem));
                        cursor.skip = cursor.skip.add(1);
                        let hop = (*cursor.skip).as_usize();
                        cursor.elem = cursor.elem.add(hop + 1);
                        cursor.skip = cursor.skip.add(hop);
                        if cursor.elem == region_end {
                            break;
                        }
                    }
                    let next = (*cursor.group).next_group;
                    Group::deallocate(cursor.group);
                    cursor.group = next;
                    if next == self.unused_groups_head {
                        break;
                    }
                    cursor = Cursor::first_live_of(next);
                }
                // The unused chain holds no elements.
                let mut group = cursor.group;
                while !group.is_null() {
                    let next = (*group).next_group;
                    Group::deallocate(group);
                    group = next;
                }
            } else {
                let mut group = self.begin.group;
                while !group.is_null() {
                    let next = (*group).next_group;
                    Group::deallocate(group);
                    group = next;
                }
            }
        }
    }
}

// =============================================================================
// Fill rollback guards
// =============================================================================

// Commits a partial tail fill when element production panics: the built
// prefix stays inserted and the unfilled rest of the block chain returns
// to the unused cache.
struct TailFillGuard<'a, T, W: SkipWord> {
    brood: &'a mut Brood<T, W>,
    constructed: usize,
}

impl<T, W: SkipWord> Drop for TailFillGuard<'_, T, W> {
    fn drop(&mut self) {
        unsafe {
            let end = self.brood.end;
            let group = end.group;
            (*group).last_endpoint = end.elem;
            (*group).len += self.constructed;
            self.brood.len += self.constructed;
            let used = end.elem.offset_from((*group).elements);
            self.brood.end.skip = (*group).skipfield.offset(used);
            if !(*group).next_group.is_null() {
                self.brood.unused_groups_head = (*group).next_group;
                (*group).next_group = ptr::null_mut();
            }
        }
    }
}

// Re-threads a coherent suffix skipblock when element production panics
// partway through filling a skipblock.
struct SkipblockFillGuard<'a, T, W: SkipWord> {
    brood: &'a mut Brood<T, W>,
    start: Cursor<T, W>,
    previous: W,
    run_len: usize,
    restore_begin: Option<Cursor<T, W>>,
    constructed: usize,
}

impl<T, W: SkipWord> Drop for SkipblockFillGuard<'_, T, W> {
    fn drop(&mut self) {
        unsafe {
            let group = self.start.group;
            let built = self.constructed;
            ptr::write_bytes(self.start.skip, 0, built);

            // The unfilled suffix becomes the block's free-list head.
            let remaining = self.run_len - built;
            debug_assert!(remaining >= 1);
            *self.start.skip.add(built) = W::from_usize(remaining);
            *self.start.skip.add(self.run_len - 1) = W::from_usize(remaining);

            let new_index =
                self.start.elem.offset_from((*group).elements) as usize + built;
            let node = Slot::node_ptr(self.start.elem.add(built));
            (*node).prev = self.previous;
            (*node).next = W::NONE;
            (*group).free_list_head = W::from_usize(new_index);
            if self.previous != W::NONE {
                (*Slot::node_ptr((*group).elements.add(self.previous.as_usize()))).next =
                    W::from_usize(new_index);
            }

            (*group).len += built;
            self.brood.len += built;
            if built == 0 {
                if let Some(old) = self.restore_begin {
                    self.brood.begin = old;
                }
            }
        }
    }
}

// =============================================================================
// Trait implementations
// =============================================================================

impl<T, W: SkipWord> Drop for Brood<T, W> {
    fn drop(&mut self) {
        unsafe {
            self.destroy_all_data();
        }
    }
}

impl<T: Clone, W: SkipWord> Clone for Brood<T, W> {
    /// Clones the container. Block capacities are re-derived from the
    /// source's length so the copy is not fragmented into small initial
    /// blocks.
    fn clone(&self) -> Self {
        let saved_min = self.min_group_capacity;
        let effective_min = if saved_min > self.len {
            saved_min
        } else {
            self.len.min(self.max_group_capacity)
        };
        let mut clone = Self::new();
        clone.min_group_capacity = effective_min;
        clone.max_group_capacity = self.max_group_capacity;
        if self.len != 0 {
            unsafe {
                clone.grow_reserve(self.len);
            }
            clone.extend(self.iter().cloned());
        }
        clone.min_group_capacity = saved_min;
        clone
    }
}

impl<T: fmt::Debug, W: SkipWord> fmt::Debug for Brood<T, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T, W: SkipWord> Extend<T> for Brood<T, W> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.insert_from_iter(iter);
    }
}

impl<T, W: SkipWord> FromIterator<T> for Brood<T, W> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut brood = Self::new();
        brood.extend(iter);
        brood
    }
}

// =============================================================================
// Tests
// =============================================================================
