//! Latest-value mailbox with one writer and any number of nested readers.
//!
//! The buffer holds two slots. Readers always get the most recently
//! published slot; the writer fills the other one and publishes it on commit.
//! Only the first reader of a burst (the one that takes the reader count from
//! zero to one) moves the read selection, so a reader nested inside another
//! reader keeps reading the slot the outer reader is using.
//!
//! The selection, the reader count and the writer flag share one atomic
//! state word, so every decision about which slot goes to whom is a single
//! compare-exchange. A writer on one core can never pick the slot a first
//! reader on another core is selecting, and an interrupted context never has
//! to wait for the one it interrupted.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::ptr;
use portable_atomic::{AtomicUsize, Ordering};

use crate::error::{fatal, AcquireError, AcquireResult, Misuse};
use crate::stats::{Counters, Snapshot};

/// Slot currently handed to readers
const SELECTED: usize = 1 << 0;
/// Slot the next first reader will select
const NEXT: usize = 1 << 1;
/// A writer holds the unselected slot
const WRITING: usize = 1 << 2;
/// Unit of the reader count kept in the remaining bits
const READER: usize = 1 << 3;

fn selected(state: usize) -> usize {
    state & SELECTED
}

fn next(state: usize) -> usize {
    (state & NEXT) >> 1
}

fn readers(state: usize) -> usize {
    state / READER
}

fn with_selected(state: usize, index: usize) -> usize {
    (state & !SELECTED) | index
}

fn with_next(state: usize, index: usize) -> usize {
    (state & !NEXT) | (index << 1)
}

pub struct DoubleBuffer<T> {
    slots: UnsafeCell<[T; 2]>,
    state: AtomicUsize,
    stats: Counters,
}

// SAFETY: readers only ever get the selected slot and the writer only the
// other one; the selection cannot move while either side holds a slot.
unsafe impl<T: Send + Sync> Sync for DoubleBuffer<T> {}

impl<T: Copy> DoubleBuffer<T> {
    /// Create a buffer whose published value is `init`.
    pub const fn new(init: T) -> Self {
        Self::from_slots([init, init])
    }
}

impl<T> DoubleBuffer<T> {
    /// Create a buffer from both slots; slot 0 is published first.
    pub const fn from_slots(slots: [T; 2]) -> Self {
        Self {
            slots: UnsafeCell::new(slots),
            state: AtomicUsize::new(0),
            stats: Counters::new(),
        }
    }

    /// Acquire the slot that is not being read, for writing.
    ///
    /// Fails with [`AcquireError::WriterBusy`] while another writer holds it.
    pub fn write_acquire(&self) -> AcquireResult<WriteSlot<'_, T>> {
        let outcome = self.update(|state| {
            if state & WRITING != 0 {
                return None;
            }
            // With nobody reading, catch the selection up with the latest
            // commit first so it is not the slot we overwrite.
            let state = if readers(state) == 0 {
                with_selected(state, next(state))
            } else {
                state
            };
            // Point the next reader at the slot being read right now, so no
            // reader can be sent to the slot we are about to fill.
            Some(with_next(state, selected(state)) | WRITING)
        });

        match outcome {
            Ok((_, state)) => Ok(WriteSlot {
                buffer: self,
                index: 1 - selected(state),
            }),
            Err(_) => {
                self.stats.record_unavailable();
                Err(AcquireError::WriterBusy)
            }
        }
    }

    /// Publish a written slot. Equivalent to dropping the handle.
    ///
    /// # Panics
    ///
    /// Panics if `slot` belongs to another buffer.
    pub fn write_commit(&self, slot: WriteSlot<'_, T>) {
        if !ptr::eq(slot.buffer, self) {
            fatal(Misuse::ForeignSlot);
        }
        drop(slot);
    }

    /// Acquire the most recently published slot. Never fails.
    pub fn read_acquire(&self) -> ReadSlot<'_, T> {
        let outcome = self.update(|state| {
            // Only the first reader of a burst moves the selection.
            let state = if readers(state) == 0 {
                with_selected(state, next(state))
            } else {
                state
            };
            Some(state + READER)
        });

        let (previous, state) = match outcome {
            Ok(states) => states,
            Err(state) => (state, state),
        };
        if readers(previous) == 0 {
            self.stats.record_helped();
        }
        self.stats.record_acquired();
        ReadSlot {
            buffer: self,
            index: selected(state),
        }
    }

    /// Release a read slot. Equivalent to dropping the handle.
    ///
    /// # Panics
    ///
    /// Panics if `slot` belongs to another buffer.
    pub fn read_release(&self, slot: ReadSlot<'_, T>) {
        if !ptr::eq(slot.buffer, self) {
            fatal(Misuse::ForeignSlot);
        }
        drop(slot);
    }

    /// Number of readers currently holding a slot.
    pub fn readers(&self) -> usize {
        readers(self.state.load(Ordering::Acquire))
    }

    /// Counters: `acquired` (reads), `unavailable` (writer busy), `completed`
    /// (commits), `retries` (state compare-exchange retries) and `helped`
    /// (rotations done by first readers).
    pub fn stats(&self) -> Snapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Apply `change` to the state word until it sticks. Returns the old and
    /// new state, or the state `change` refused.
    fn update(
        &self,
        mut change: impl FnMut(usize) -> Option<usize>,
    ) -> Result<(usize, usize), usize> {
        let mut retries = 0;
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let Some(next) = change(current) else {
                self.stats.record_retries(retries);
                return Err(current);
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.stats.record_retries(retries);
                    return Ok((current, next));
                }
                Err(actual) => {
                    current = actual;
                    retries += 1;
                }
            }
        }
    }

    fn slot_ptr(&self, index: usize) -> *mut T {
        debug_assert!(index < 2);
        // SAFETY: index is 0 or 1.
        unsafe { self.slots.get().cast::<T>().add(index) }
    }

    fn commit_index(&self, index: usize) {
        let _ = self.update(|state| Some(with_next(state, index) & !WRITING));
        self.stats.record_completed();
    }

    fn release_reader(&self) {
        self.state.fetch_sub(READER, Ordering::SeqCst);
    }
}

impl<T> fmt::Debug for DoubleBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("DoubleBuffer")
            .field("selected_read", &selected(state))
            .field("next_read", &next(state))
            .field("readers", &readers(state))
            .field("writing", &(state & WRITING != 0))
            .finish()
    }
}

/// Writer's handle to the unpublished slot. Dropping it publishes the slot.
#[derive(Debug)]
pub struct WriteSlot<'a, T> {
    buffer: &'a DoubleBuffer<T>,
    index: usize,
}

impl<'a, T> WriteSlot<'a, T> {
    /// Publish this slot as the latest value.
    pub fn commit(self) {
        drop(self);
    }
}

impl<'a, T> Deref for WriteSlot<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: readers are only ever directed at the selected slot.
        unsafe { &*self.buffer.slot_ptr(self.index) }
    }
}

impl<'a, T> DerefMut for WriteSlot<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer flag makes this the only writer handle.
        unsafe { &mut *self.buffer.slot_ptr(self.index) }
    }
}

impl<'a, T> Drop for WriteSlot<'a, T> {
    fn drop(&mut self) {
        self.buffer.commit_index(self.index);
    }
}

/// Reader's handle to the published slot. Dropping it releases the slot.
pub struct ReadSlot<'a, T> {
    buffer: &'a DoubleBuffer<T>,
    index: usize,
}

impl<'a, T> ReadSlot<'a, T> {
    pub fn release(self) {
        drop(self);
    }
}

impl<'a, T> Deref for ReadSlot<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the selection only moves while the reader count is zero,
        // and the writer always holds the unselected slot.
        unsafe { &*self.buffer.slot_ptr(self.index) }
    }
}

impl<'a, T> Drop for ReadSlot<'a, T> {
    fn drop(&mut self) {
        self.buffer.release_reader();
    }
}
