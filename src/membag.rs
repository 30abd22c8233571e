//! Fixed-capacity slot allocator with static storage.
//!
//! A [`Membag`] hands out slots from an array whose size is fixed at compile
//! time. Acquisition first reserves capacity through a free counter and only
//! then searches the allocation flags, so the search always ends in a claim.
//!
//! ```
//! use aint_safe::Membag;
//!
//! static POOL: Membag<[u8; 16], 4> = Membag::new([0; 16]);
//!
//! POOL.init();
//! let mut buf = POOL.acquire().unwrap();
//! buf[0] = 0xAA;
//! POOL.release(buf);
//! ```

use core::cell::UnsafeCell;
use core::fmt;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr;
use portable_atomic::{AtomicBool, AtomicIsize, Ordering};

use crate::error::{fatal, AcquireError, AcquireResult, Misuse};
use crate::stats::{Counters, Snapshot};

/// Pool of `N` slots of type `T`.
///
/// Must be initialized with [`Membag::init`] exactly once before use. Until
/// then every [`acquire`](Membag::acquire) reports
/// [`AcquireError::Exhausted`].
///
/// Slot contents are kept across release and re-acquisition; a freshly
/// acquired slot holds whatever its previous owner left in it.
pub struct Membag<T, const N: usize> {
    slots: UnsafeCell<[T; N]>,
    /// `true` while the slot at the same index is handed out
    allocated: [AtomicBool; N],
    /// Slots not yet reserved; briefly negative while an acquire backs off
    n_free: AtomicIsize,
    initialized: AtomicBool,
    stats: Counters,
}

// Slots are only reachable through a `Slot` handle, one per index.
unsafe impl<T: Send, const N: usize> Sync for Membag<T, N> {}

impl<T: Copy, const N: usize> Membag<T, N> {
    /// Create a pool whose slots all start out as `init`.
    pub const fn new(init: T) -> Self {
        Self::from_slots([init; N])
    }
}

impl<T, const N: usize> Membag<T, N> {
    const VALID_CAPACITY: () = assert!(
        N > 0 && N <= isize::MAX as usize,
        "membag capacity must be non-zero and fit an isize"
    );

    /// Create a pool from explicit initial slot contents.
    pub const fn from_slots(slots: [T; N]) -> Self {
        let () = Self::VALID_CAPACITY;
        Self {
            slots: UnsafeCell::new(slots),
            allocated: [const { AtomicBool::new(true) }; N],
            n_free: AtomicIsize::new(0),
            initialized: AtomicBool::new(false),
            stats: Counters::new(),
        }
    }

    /// Clear every allocation flag and make all `N` slots available.
    ///
    /// # Panics
    ///
    /// Panics if the pool has already been initialized.
    pub fn init(&self) {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            fatal(Misuse::DoubleInit);
        }
        for flag in &self.allocated {
            flag.store(false, Ordering::Release);
        }
        self.n_free.store(N as isize, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Acquire a free slot.
    pub fn acquire(&self) -> AcquireResult<Slot<'_, T, N>> {
        let reserved = self.n_free.fetch_sub(1, Ordering::AcqRel);
        if reserved <= 0 {
            self.n_free.fetch_add(1, Ordering::AcqRel);
            self.stats.record_unavailable();
            return Err(AcquireError::Exhausted);
        }

        // One slot is ours somewhere in the array; find and claim it.
        let mut index = 0;
        let mut steps = 0;
        while self.allocated[index].swap(true, Ordering::Acquire) {
            index = (index + 1) % N;
            steps += 1;
        }

        self.stats.record_retries(steps);
        self.stats.record_acquired();
        Ok(Slot { bag: self, index })
    }

    /// Return a slot to the pool.
    ///
    /// Equivalent to dropping the handle.
    ///
    /// # Panics
    ///
    /// Panics if `slot` was acquired from a different pool.
    pub fn release(&self, slot: Slot<'_, T, N>) {
        if !ptr::eq(slot.bag, self) {
            fatal(Misuse::ForeignSlot);
        }
        drop(slot);
    }

    /// Rebuild a handle from an index produced by [`Slot::into_raw`].
    ///
    /// # Safety
    ///
    /// `index` must come from `into_raw` on a slot of this pool, and each such
    /// index may be rebuilt only once. Rebuilding a slot that is not
    /// allocated leads to a double release, which inflates the free counter
    /// past the number of clear flags; a later [`acquire`](Membag::acquire)
    /// can then spin forever looking for a slot that does not exist.
    pub unsafe fn from_raw(&self, index: usize) -> Slot<'_, T, N> {
        if index >= N {
            fatal(Misuse::ForeignSlot);
        }
        Slot { bag: self, index }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of slots not currently reserved.
    pub fn available(&self) -> usize {
        self.n_free.load(Ordering::Acquire).max(0) as usize
    }

    /// Counters: `acquired`, `unavailable` (exhausted), `completed`
    /// (released) and `retries` (flag scan steps past the first).
    pub fn stats(&self) -> Snapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    fn slot_ptr(&self, index: usize) -> *mut T {
        debug_assert!(index < N);
        // SAFETY: index < N keeps the pointer inside the slot array.
        unsafe { self.slots.get().cast::<T>().add(index) }
    }

    fn release_index(&self, index: usize) {
        self.allocated[index].store(false, Ordering::Release);
        self.n_free.fetch_add(1, Ordering::AcqRel);
        self.stats.record_completed();
    }
}

impl<T, const N: usize> fmt::Debug for Membag<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Membag")
            .field("capacity", &N)
            .field("available", &self.available())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Exclusive handle to one acquired slot of a [`Membag`].
///
/// Dropping the handle releases the slot.
pub struct Slot<'a, T, const N: usize> {
    bag: &'a Membag<T, N>,
    index: usize,
}

impl<'a, T, const N: usize> Slot<'a, T, N> {
    /// Position of this slot in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Give up the handle without releasing the slot and return its index.
    ///
    /// The slot stays allocated until [`Membag::from_raw`] rebuilds the
    /// handle and it is released.
    pub fn into_raw(self) -> usize {
        let index = self.index;
        mem::forget(self);
        index
    }
}

impl<'a, T, const N: usize> Deref for Slot<'a, T, N> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the allocation flag gives this handle sole access to the slot.
        unsafe { &*self.bag.slot_ptr(self.index) }
    }
}

impl<'a, T, const N: usize> DerefMut for Slot<'a, T, N> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as for `deref`, and `&mut self` excludes other borrows.
        unsafe { &mut *self.bag.slot_ptr(self.index) }
    }
}

impl<'a, T, const N: usize> Drop for Slot<'a, T, N> {
    fn drop(&mut self) {
        self.bag.release_index(self.index);
    }
}

impl<'a, T: fmt::Debug, const N: usize> fmt::Debug for Slot<'a, T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("value", &**self)
            .finish()
    }
}
