//! Bounded MPMC ring queue with an acquire/commit protocol on both sides.
//!
//! Writers acquire a slot, fill it in place and commit it; readers acquire a
//! committed slot, consume it in place and release it. The six cursors and
//! counts that describe the ring are kept in one [`Mcas`], so every state
//! change is a single multi-word compare-and-swap.
//!
//! How commits may be reordered relative to acquires is chosen per side with
//! [`CommitOrder`]:
//!
//! - [`CommitOrder::Nested`]: acquire/commit pairs nest like interrupt
//!   handlers do. A commit of a younger slot only marks it finished; the
//!   commit of the oldest outstanding slot then publishes it together with
//!   every finished slot acquired after it, in one step. A slot whose handle
//!   is still live is never published, whatever order commits arrive in.
//! - [`CommitOrder::Fcfs`]: commits must come in acquire order. Committing any
//!   other slot is a fatal misuse.
//!
//! ```
//! use aint_safe::{NestedQueue, QueueConfig};
//!
//! static EVENTS: NestedQueue<u32, 8> = NestedQueue::new(0, QueueConfig::new());
//!
//! let mut slot = EVENTS.write_acquire().unwrap();
//! *slot = 17;
//! slot.commit();
//!
//! let slot = EVENTS.read_acquire().unwrap();
//! assert_eq!(*slot, 17);
//! ```

use core::cell::UnsafeCell;
use core::fmt;
use core::iter::FusedIterator;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use portable_atomic::{AtomicIsize, Ordering};

use crate::error::{fatal, AcquireError, AcquireResult, Misuse};
use crate::mcas::{Mcas, Word};
use crate::stats::{Counters, Snapshot};

const WRITE_ALLOCATED: usize = 0;
const WRITE_COMMITTED: usize = 1;
const READ_ACQUIRED: usize = 2;
const READ_RELEASED: usize = 3;
const COUNT_WRITABLE: usize = 4;
const COUNT_READABLE: usize = 5;

/// Commit discipline for one side of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOrder {
    /// Commits nest inside each other; the oldest one publishes the rest.
    Nested,
    /// Commits follow acquire order exactly.
    Fcfs,
}

/// Ordering policy for both sides of a [`NestedQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub write: CommitOrder,
    pub read: CommitOrder,
}

impl QueueConfig {
    /// Both sides [`CommitOrder::Nested`].
    pub const fn new() -> Self {
        Self {
            write: CommitOrder::Nested,
            read: CommitOrder::Nested,
        }
    }

    /// Both sides [`CommitOrder::Fcfs`].
    pub const fn fcfs() -> Self {
        Self {
            write: CommitOrder::Fcfs,
            read: CommitOrder::Fcfs,
        }
    }

    pub const fn write_order(mut self, order: CommitOrder) -> Self {
        self.write = order;
        self
    }

    pub const fn read_order(mut self, order: CommitOrder) -> Self {
        self.read = order;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Index vector positions used by one side.
#[derive(Clone, Copy)]
struct Side {
    /// Row of `finished` for this side
    id: usize,
    acquire: usize,
    commit: usize,
    /// Count consumed by an acquire
    count: usize,
    /// Count credited by a commit
    credit: usize,
    unavailable: AcquireError,
}

const WRITE: Side = Side {
    id: 0,
    acquire: WRITE_ALLOCATED,
    commit: WRITE_COMMITTED,
    count: COUNT_WRITABLE,
    credit: COUNT_READABLE,
    unavailable: AcquireError::Full,
};

const READ: Side = Side {
    id: 1,
    acquire: READ_ACQUIRED,
    commit: READ_RELEASED,
    count: COUNT_READABLE,
    credit: COUNT_WRITABLE,
    unavailable: AcquireError::Empty,
};

/// No cursor is ever equal to this.
const UNFINISHED: Word = -1;

/// Ring of `N` slots of type `T`.
///
/// Cursors run modulo `2 * N`, so a side with all `N` slots outstanding is
/// distinguishable from a side with none.
pub struct NestedQueue<T, const N: usize> {
    slots: UnsafeCell<[T; N]>,
    indices: Mcas<6>,
    /// Per side and slot, the cursor of the last nested commit of that slot.
    /// A cursor of the previous lap differs by `N`, so stale marks never match.
    finished: [[AtomicIsize; N]; 2],
    config: QueueConfig,
    stats: Counters,
}

// SAFETY: a slot belongs to the handle that acquired it until that handle is
// dropped. Commits only advance over slots whose handles are gone.
unsafe impl<T: Send, const N: usize> Sync for NestedQueue<T, N> {}

impl<T: Copy, const N: usize> NestedQueue<T, N> {
    pub const fn new(init: T, config: QueueConfig) -> Self {
        Self::from_slots([init; N], config)
    }
}

impl<T, const N: usize> NestedQueue<T, N> {
    const VALID_CAPACITY: () = assert!(
        N > 0 && N <= (isize::MAX as usize) / 2,
        "queue capacity must be non-zero and leave room for cursor wrap-around"
    );

    const WRAP: Word = 2 * N as Word;

    pub const fn from_slots(slots: [T; N], config: QueueConfig) -> Self {
        let () = Self::VALID_CAPACITY;
        Self {
            slots: UnsafeCell::new(slots),
            indices: Mcas::new([0, 0, 0, 0, N as Word, 0]),
            finished: [const { [const { AtomicIsize::new(UNFINISHED) }; N] }; 2],
            config,
            stats: Counters::new(),
        }
    }

    /// Acquire an empty slot for writing.
    pub fn write_acquire(&self) -> AcquireResult<WriteSlot<'_, T, N>> {
        let cursor = self.acquire(WRITE)?;
        Ok(WriteSlot {
            queue: self,
            cursor,
        })
    }

    /// Commit a written slot. Equivalent to dropping the handle.
    ///
    /// Under [`CommitOrder::Nested`] the slot becomes readable once every
    /// slot acquired before it has been committed too.
    ///
    /// # Panics
    ///
    /// Panics if `slot` belongs to another queue, or if the write side is
    /// [`CommitOrder::Fcfs`] and `slot` is not the oldest outstanding one.
    pub fn write_commit(&self, slot: WriteSlot<'_, T, N>) {
        if !ptr::eq(slot.queue, self) {
            fatal(Misuse::ForeignSlot);
        }
        drop(slot);
    }

    /// Acquire the oldest committed slot for reading.
    pub fn read_acquire(&self) -> AcquireResult<ReadSlot<'_, T, N>> {
        let cursor = self.acquire(READ)?;
        Ok(ReadSlot {
            queue: self,
            cursor,
        })
    }

    /// Release a read slot back to the writers. Equivalent to dropping the
    /// handle.
    ///
    /// # Panics
    ///
    /// Panics if `slot` belongs to another queue, or if the read side is
    /// [`CommitOrder::Fcfs`] and `slot` is not the oldest outstanding one.
    pub fn read_release(&self, slot: ReadSlot<'_, T, N>) {
        if !ptr::eq(slot.queue, self) {
            fatal(Misuse::ForeignSlot);
        }
        drop(slot);
    }

    /// Slots acquired by writers and not yet committed, oldest first.
    ///
    /// The region is captured once; the caller must keep it from shrinking
    /// while dereferencing the yielded pointers.
    pub fn write_acquired(&self) -> Acquired<'_, T, N> {
        self.acquired(WRITE)
    }

    /// Slots acquired by readers and not yet released, oldest first.
    ///
    /// Same caveat as [`write_acquired`](Self::write_acquired).
    pub fn read_acquired(&self) -> Acquired<'_, T, N> {
        self.acquired(READ)
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Committed slots waiting for a reader.
    pub fn readable(&self) -> usize {
        self.indices.read()[COUNT_READABLE] as usize
    }

    /// Free slots waiting for a writer.
    pub fn writable(&self) -> usize {
        self.indices.read()[COUNT_WRITABLE] as usize
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Counters: `acquired`, `unavailable` (full or empty), `completed`
    /// (commits and releases that advanced), `retries` (index vector
    /// conflicts) and `helped` (nested commits left for an older slot's
    /// commit to publish).
    pub fn stats(&self) -> Snapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    fn advance(cursor: Word, by: Word) -> Word {
        (cursor + by) % Self::WRAP
    }

    fn slot_ptr(&self, cursor: Word) -> *mut T {
        let index = cursor as usize % N;
        // SAFETY: index < N keeps the pointer inside the slot array.
        unsafe { self.slots.get().cast::<T>().add(index) }
    }

    fn acquire(&self, side: Side) -> AcquireResult<Word> {
        let mut retries = 0;
        loop {
            let current = self.indices.read();
            if current[side.count] == 0 {
                self.stats.record_retries(retries);
                self.stats.record_unavailable();
                return Err(side.unavailable);
            }

            let mut next = current;
            next[side.count] -= 1;
            next[side.acquire] = Self::advance(current[side.acquire], 1);
            if self.indices.compare_exchange(&current, &next) {
                self.stats.record_retries(retries);
                self.stats.record_acquired();
                return Ok(current[side.acquire]);
            }
            retries += 1;
        }
    }

    fn commit(&self, side: Side, order: CommitOrder, cursor: Word) {
        match order {
            CommitOrder::Nested => {
                self.finished[side.id][cursor as usize % N].store(cursor, Ordering::SeqCst);
                self.sweep(side);
            }
            CommitOrder::Fcfs => self.commit_in_order(side, cursor),
        }
    }

    /// Advance the commit cursor of `side` over the run of finished slots at
    /// its head and credit them to the other side.
    fn sweep(&self, side: Side) {
        let finished = &self.finished[side.id];
        let mut retries = 0;
        loop {
            let current = self.indices.read();
            let head = current[side.commit];
            let outstanding = (current[side.acquire] - head).rem_euclid(Self::WRAP);

            let mut run = 0;
            while run < outstanding {
                let cursor = Self::advance(head, run);
                if finished[cursor as usize % N].load(Ordering::SeqCst) != cursor {
                    break;
                }
                run += 1;
            }
            if run == 0 {
                // An older slot is still held; its commit will publish this
                // one along with its own.
                self.stats.record_retries(retries);
                self.stats.record_helped();
                return;
            }

            let mut next = current;
            next[side.commit] = Self::advance(head, run);
            next[side.credit] += run;
            if self.indices.compare_exchange(&current, &next) {
                self.stats.record_retries(retries);
                self.stats.record_completed();
                return;
            }
            retries += 1;
        }
    }

    fn commit_in_order(&self, side: Side, cursor: Word) {
        let mut retries = 0;
        loop {
            let current = self.indices.read();
            let head = current[side.commit];
            if head != cursor {
                fatal(Misuse::OutOfOrderCommit);
            }

            let mut next = current;
            next[side.commit] = Self::advance(head, 1);
            next[side.credit] += 1;
            if self.indices.compare_exchange(&current, &next) {
                self.stats.record_retries(retries);
                self.stats.record_completed();
                return;
            }
            retries += 1;
        }
    }

    fn acquired(&self, side: Side) -> Acquired<'_, T, N> {
        let current = self.indices.read();
        let start = current[side.commit];
        let remaining = (current[side.acquire] - start).rem_euclid(Self::WRAP) as usize;
        Acquired {
            queue: self,
            cursor: start,
            remaining,
        }
    }
}

impl<T, const N: usize> fmt::Debug for NestedQueue<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indices = self.indices.read();
        f.debug_struct("NestedQueue")
            .field("capacity", &N)
            .field("write_allocated", &indices[WRITE_ALLOCATED])
            .field("write_committed", &indices[WRITE_COMMITTED])
            .field("read_acquired", &indices[READ_ACQUIRED])
            .field("read_released", &indices[READ_RELEASED])
            .field("writable", &indices[COUNT_WRITABLE])
            .field("readable", &indices[COUNT_READABLE])
            .field("config", &self.config)
            .finish()
    }
}

/// Writer's handle to an acquired slot. Dropping it commits the slot.
#[derive(Debug)]
pub struct WriteSlot<'a, T, const N: usize> {
    queue: &'a NestedQueue<T, N>,
    cursor: Word,
}

impl<'a, T, const N: usize> WriteSlot<'a, T, N> {
    /// Position of this slot in the ring.
    pub fn index(&self) -> usize {
        self.cursor as usize % N
    }

    pub fn commit(self) {
        drop(self);
    }
}

impl<'a, T, const N: usize> Deref for WriteSlot<'a, T, N> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the commit cursor cannot pass this slot while the handle
        // lives, so no reader can acquire it.
        unsafe { &*self.queue.slot_ptr(self.cursor) }
    }
}

impl<'a, T, const N: usize> DerefMut for WriteSlot<'a, T, N> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as for `deref`.
        unsafe { &mut *self.queue.slot_ptr(self.cursor) }
    }
}

impl<'a, T, const N: usize> Drop for WriteSlot<'a, T, N> {
    fn drop(&mut self) {
        self.queue.commit(WRITE, self.queue.config.write, self.cursor);
    }
}

/// Reader's handle to an acquired slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct ReadSlot<'a, T, const N: usize> {
    queue: &'a NestedQueue<T, N>,
    cursor: Word,
}

impl<'a, T, const N: usize> ReadSlot<'a, T, N> {
    /// Position of this slot in the ring.
    pub fn index(&self) -> usize {
        self.cursor as usize % N
    }

    pub fn release(self) {
        drop(self);
    }
}

impl<'a, T, const N: usize> Deref for ReadSlot<'a, T, N> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: writers cannot reach a slot until its reader releases it.
        unsafe { &*self.queue.slot_ptr(self.cursor) }
    }
}

impl<'a, T, const N: usize> Drop for ReadSlot<'a, T, N> {
    fn drop(&mut self) {
        self.queue.commit(READ, self.queue.config.read, self.cursor);
    }
}

/// Snapshot iterator over the outstanding slots of one side.
pub struct Acquired<'a, T, const N: usize> {
    queue: &'a NestedQueue<T, N>,
    cursor: Word,
    remaining: usize,
}

impl<'a, T, const N: usize> Iterator for Acquired<'a, T, N> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        if self.remaining == 0 {
            return None;
        }
        let slot = self.queue.slot_ptr(self.cursor);
        self.cursor = NestedQueue::<T, N>::advance(self.cursor, 1);
        self.remaining -= 1;
        NonNull::new(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T, const N: usize> ExactSizeIterator for Acquired<'a, T, N> {}

impl<'a, T, const N: usize> FusedIterator for Acquired<'a, T, N> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn test_fcfs_fill_drain_refill() {
        let queue: NestedQueue<u32, 4> = NestedQueue::new(0, QueueConfig::fcfs());

        let mut writers = Vec::new();
        for value in 0..4 {
            let mut slot = queue.write_acquire().unwrap();
            *slot = value * 10;
            writers.push(slot);
        }
        assert_eq!(queue.write_acquire().unwrap_err(), AcquireError::Full);
        assert_eq!(queue.write_acquired().len(), 4);

        for slot in writers {
            queue.write_commit(slot);
        }
        assert_eq!(queue.readable(), 4);
        assert_eq!(queue.writable(), 0);

        let mut readers = Vec::new();
        for expected in 0..4 {
            let slot = queue.read_acquire().unwrap();
            assert_eq!(*slot, expected * 10);
            assert_eq!(slot.index(), expected as usize);
            readers.push(slot);
        }
        assert_eq!(queue.read_acquire().unwrap_err(), AcquireError::Empty);

        for slot in readers {
            slot.release();
        }
        assert_eq!(queue.writable(), 4);
        assert!(queue.write_acquire().is_ok());
    }

    #[test]
    fn test_nested_commit_folds_inner_acquisitions() {
        let queue: NestedQueue<u8, 4> = NestedQueue::new(0, QueueConfig::new());

        let mut outer = queue.write_acquire().unwrap();
        *outer = 1;
        let mut inner = queue.write_acquire().unwrap();
        *inner = 2;

        // The inner commit happens first and changes nothing.
        inner.commit();
        assert_eq!(queue.readable(), 0);
        assert_eq!(queue.write_acquired().len(), 2);

        outer.commit();
        assert_eq!(queue.readable(), 2);
        assert_eq!(queue.write_acquired().len(), 0);

        assert_eq!(*queue.read_acquire().unwrap(), 1);
        assert_eq!(*queue.read_acquire().unwrap(), 2);
        assert_eq!(queue.stats().helped, 1);

        queue.reset_stats();
        assert_eq!(queue.stats(), Snapshot::default());
    }

    #[test]
    fn test_nested_release_folds_inner_releases() {
        let queue: NestedQueue<u8, 4> = NestedQueue::new(0, QueueConfig::new());
        for value in [1, 2] {
            let mut slot = queue.write_acquire().unwrap();
            *slot = value;
        }
        assert_eq!(queue.writable(), 2);

        let outer = queue.read_acquire().unwrap();
        let inner = queue.read_acquire().unwrap();
        assert_eq!((*outer, *inner), (1, 2));

        // The inner release is left for the outer one.
        inner.release();
        assert_eq!(queue.writable(), 2);
        assert_eq!(queue.read_acquired().len(), 2);

        outer.release();
        assert_eq!(queue.writable(), 4);
        assert_eq!(queue.read_acquired().len(), 0);
        assert_eq!(queue.readable(), 0);
    }

    #[test]
    fn test_oldest_commit_never_publishes_a_live_slot() {
        let queue: NestedQueue<u32, 4> = NestedQueue::new(0, QueueConfig::new());
        let mut older = queue.write_acquire().unwrap();
        *older = 1;
        let mut younger = queue.write_acquire().unwrap();
        *younger = 2;

        // Committed out of nesting order: only the older slot is published.
        older.commit();
        assert_eq!(queue.readable(), 1);
        let first = queue.read_acquire().unwrap();
        assert_eq!(*first, 1);
        assert_eq!(queue.read_acquire().unwrap_err(), AcquireError::Empty);

        *younger = 99;
        assert_eq!(*first, 1);
        younger.commit();
        assert_eq!(queue.readable(), 1);
        assert_eq!(*queue.read_acquire().unwrap(), 99);
        drop(first);
        assert_eq!(queue.writable(), 4);
    }

    #[test]
    fn test_finished_marks_from_previous_laps_are_ignored() {
        let queue: NestedQueue<usize, 2> = NestedQueue::new(0, QueueConfig::new());
        for lap in 0..10 {
            let mut older = queue.write_acquire().unwrap();
            *older = lap;
            let younger = queue.write_acquire().unwrap();
            // The younger slot's mark from two acquisitions ago must not
            // let the older commit publish it.
            older.commit();
            assert_eq!(queue.readable(), 1);
            drop(younger);
            assert_eq!(queue.readable(), 2);
            assert_eq!(*queue.read_acquire().unwrap(), lap);
            let _ = queue.read_acquire().unwrap();
        }
        assert_eq!(queue.writable(), 2);
    }

    #[test]
    fn test_full_queue_never_overwrites_unread_slot() {
        let queue: NestedQueue<u16, 2> = NestedQueue::new(0, QueueConfig::new());
        for value in [5, 6] {
            let mut slot = queue.write_acquire().unwrap();
            *slot = value;
        }
        assert!(queue.write_acquire().is_err());
        assert_eq!(queue.stats().unavailable, 1);

        assert_eq!(*queue.read_acquire().unwrap(), 5);
        let mut slot = queue.write_acquire().unwrap();
        *slot = 7;
        drop(slot);
        assert_eq!(*queue.read_acquire().unwrap(), 6);
        assert_eq!(*queue.read_acquire().unwrap(), 7);
    }

    #[test]
    fn test_cursors_wrap_many_times() {
        let queue: NestedQueue<usize, 3> = NestedQueue::new(0, QueueConfig::fcfs());
        for value in 0..100 {
            let mut slot = queue.write_acquire().unwrap();
            *slot = value;
            slot.commit();
            let slot = queue.read_acquire().unwrap();
            assert_eq!(*slot, value);
            assert_eq!(slot.index(), value % 3);
        }
        assert_eq!(queue.writable() + queue.readable(), 3);
    }

    #[test]
    fn test_acquired_iterator_yields_outstanding_slots_in_order() {
        let queue: NestedQueue<u32, 4> = NestedQueue::new(0, QueueConfig::new());
        let mut first = queue.write_acquire().unwrap();
        *first = 11;
        let mut second = queue.write_acquire().unwrap();
        *second = 22;

        let seen: Vec<u32> = queue
            .write_acquired()
            .map(|slot| unsafe { *slot.as_ptr() })
            .collect();
        assert_eq!(seen, [11, 22]);

        drop(second);
        drop(first);
        let reader = queue.read_acquire().unwrap();
        let mut held = queue.read_acquired();
        assert_eq!(held.len(), 1);
        assert_eq!(held.next().map(|p| p.as_ptr() as *const u32), Some(&*reader as *const u32));
        assert!(held.next().is_none());
    }

    #[test]
    fn test_mixed_config() {
        let config = QueueConfig::new().read_order(CommitOrder::Fcfs);
        assert_eq!(config.write, CommitOrder::Nested);
        assert_eq!(config.read, CommitOrder::Fcfs);
        assert_eq!(QueueConfig::default(), QueueConfig::new());

        let queue: NestedQueue<u8, 2> = NestedQueue::new(0, config);
        assert_eq!(queue.config(), config);
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    #[should_panic(expected = "FCFS commit does not match")]
    fn test_fcfs_out_of_order_commit_is_fatal() {
        let queue: NestedQueue<u8, 4> = NestedQueue::new(0, QueueConfig::fcfs());
        let first = queue.write_acquire().unwrap();
        let second = queue.write_acquire().unwrap();
        queue.write_commit(second);
        drop(first);
    }
}
