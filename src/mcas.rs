//! Interrupt-safe multi-word compare-and-swap.
//!
//! An [`Mcas`] holds `N` machine words that can be read as one consistent
//! snapshot and compare-and-swapped as one unit, using nothing but
//! single-word atomics and without ever masking interrupts.
//!
//! # Journal
//!
//! Every call builds a journal entry describing its operation and appends it
//! to the end of a shared singly linked list. It then walks the list from the
//! head and completes every entry whose status is still undefined, up to and
//! including its own. A context that interrupts another in the middle of an
//! operation therefore finishes the interrupted operation before doing its
//! own, and no context ever waits for one that cannot run. Finally the caller
//! retires its own, now settled, entry and unlinks it.
//!
//! Completing an entry is written so that any number of helpers, preempted
//! or running on other cores, only ever perform steps that are still pending:
//!
//! - a read entry stores a word into its destination only if the entry was
//!   still open after the word was loaded. While a read is open no later
//!   operation can move any word, so every helper stores the same snapshot.
//! - a compare-exchange entry compares every word and then decides between
//!   `Swapping` and `Failure` with one status transition. Only under
//!   `Swapping` is each word moved from its expected to its desired value,
//!   with a per-word compare-exchange that re-checks the status first. A
//!   helper that resumes after the entry settled cannot clobber words written
//!   by later operations, unless a word has cycled back to exactly the
//!   expected value in the meantime.
//!
//! # Entry storage
//!
//! Entries live in a table of `K` slots inside the `Mcas` itself, so the
//! journal never allocates and an entry's memory outlives every helper that
//! can still reach it. Links are slot indices, and a retired entry's `next`
//! link carries a mark bit so nothing can be appended behind it while it is
//! being unlinked. Each slot counts its holders: the owner, from allocation
//! until its entry is unlinked, plus every walker currently standing on it. A
//! slot is only reused once that count drops to zero, so a helper that is
//! preempted or simply slow never sees its entry replaced under it.
//!
//! A context inside an operation holds at most three slots at once. `K`
//! must cover three per context that can be inside an operation at the same
//! time, counting nested interrupt levels and cores. If every slot is held,
//! allocation spins until one is released.
//!
//! ```
//! use aint_safe::Mcas;
//!
//! static PAIR: Mcas<2> = Mcas::new([0, 0]);
//!
//! assert!(PAIR.compare_exchange(&[0, 0], &[1, 1]));
//! assert!(!PAIR.compare_exchange(&[0, 0], &[2, 2]));
//! assert_eq!(PAIR.read(), [1, 1]);
//! ```

use core::fmt;
use core::hint;
use portable_atomic::{AtomicIsize, AtomicU8, AtomicUsize, Ordering};

use crate::error::{fatal, Misuse};
use crate::stats::{Counters, Snapshot};

/// Value type of one MCAS word.
pub type Word = isize;

/// Journal slots per [`Mcas`] unless chosen with [`Mcas::with_slots`].
pub const DEFAULT_SLOTS: usize = 16;

/// End of the journal.
const NIL: usize = 0;
/// Set on the `next` link of a retired entry.
const MARK: usize = 1;

fn link_to(index: usize) -> usize {
    (index + 1) << 1
}

fn link_index(link: usize) -> Option<usize> {
    (link >> 1).checked_sub(1)
}

fn is_marked(link: usize) -> bool {
    link & MARK != 0
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Undefined = 0,
    Swapping = 1,
    Success = 2,
    Failure = 3,
}

impl Status {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Status::Swapping,
            2 => Status::Success,
            3 => Status::Failure,
            _ => Status::Undefined,
        }
    }

    fn is_settled(self) -> bool {
        matches!(self, Status::Success | Status::Failure)
    }
}

const KIND_READ: u8 = 0;
const KIND_COMPARE_EXCHANGE: u8 = 1;

/// What an entry asks for, borrowed from its slot.
enum Operation<'e, const N: usize> {
    Read {
        dest: &'e [AtomicIsize; N],
    },
    CompareExchange {
        expected: &'e [AtomicIsize; N],
        desired: &'e [AtomicIsize; N],
    },
}

struct Entry<const N: usize> {
    refs: AtomicUsize,
    next: AtomicUsize,
    kind: AtomicU8,
    status: AtomicU8,
    /// Read destination, or the expected words
    first: [AtomicIsize; N],
    /// Desired words
    second: [AtomicIsize; N],
}

impl<const N: usize> Entry<N> {
    const fn new() -> Self {
        Self {
            refs: AtomicUsize::new(0),
            next: AtomicUsize::new(NIL),
            kind: AtomicU8::new(KIND_READ),
            status: AtomicU8::new(Status::Undefined as u8),
            first: [const { AtomicIsize::new(0) }; N],
            second: [const { AtomicIsize::new(0) }; N],
        }
    }

    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`, or report the status another helper set.
    fn transition(&self, from: Status, to: Status) -> Result<(), Status> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(Status::from_u8)
    }

    fn operation(&self) -> Operation<'_, N> {
        match self.kind.load(Ordering::SeqCst) {
            KIND_COMPARE_EXCHANGE => Operation::CompareExchange {
                expected: &self.first,
                desired: &self.second,
            },
            _ => Operation::Read { dest: &self.first },
        }
    }
}

/// One reference on a journal slot, released on drop.
struct Held<'m, const N: usize> {
    entry: &'m Entry<N>,
    index: usize,
}

impl<const N: usize> Drop for Held<'_, N> {
    fn drop(&mut self) {
        self.entry.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Visit<'m, const N: usize> {
    Entry(&'m Entry<N>, usize),
    /// The unmarked `NIL` link that ends the journal.
    End(&'m AtomicUsize),
}

enum Flow {
    Continue,
    Stop,
}

/// `N` words supporting atomic multi-word read and compare-and-swap, with a
/// journal of `K` entry slots.
pub struct Mcas<const N: usize, const K: usize = DEFAULT_SLOTS> {
    words: [AtomicIsize; N],
    journal: AtomicUsize,
    slots: [Entry<N>; K],
    stats: Counters,
}

impl<const N: usize> Mcas<N> {
    pub const fn new(initial: [Word; N]) -> Self {
        Self::with_slots(initial)
    }
}

impl<const N: usize, const K: usize> Mcas<N, K> {
    /// Like [`Mcas::new`] with an explicit journal size.
    pub const fn with_slots(initial: [Word; N]) -> Self {
        assert!(K > 0, "an Mcas needs at least one journal slot");
        let mut words = [const { AtomicIsize::new(0) }; N];
        let mut i = 0;
        while i < N {
            words[i] = AtomicIsize::new(initial[i]);
            i += 1;
        }
        Self {
            words,
            journal: AtomicUsize::new(NIL),
            slots: [const { Entry::new() }; K],
            stats: Counters::new(),
        }
    }

    /// Read all words as one consistent snapshot.
    pub fn read(&self) -> [Word; N] {
        let mut out = [0; N];
        self.read_into(&mut out);
        out
    }

    /// Read all words as one consistent snapshot into `out`.
    ///
    /// # Panics
    ///
    /// Panics if the read is still unsettled after the journal walk, which
    /// means the journal itself is corrupt.
    pub fn read_into(&self, out: &mut [Word; N]) {
        self.stats.record_acquired();
        let own = self.begin_read();
        self.finish(&own);

        for (value, word) in out.iter_mut().zip(&own.entry.first) {
            *value = word.load(Ordering::SeqCst);
        }
        self.retire(own);
        self.stats.record_completed();
    }

    /// Replace all words with `desired` if they currently equal `expected`.
    ///
    /// Returns `false` only when the comparison saw a real mismatch, never
    /// because of contention. Unlike single-word compare-exchange, the
    /// current values are not reported back on failure.
    pub fn compare_exchange(&self, expected: &[Word; N], desired: &[Word; N]) -> bool {
        self.stats.record_acquired();
        let own = self.begin_compare_exchange(expected, desired);
        self.finish(&own);

        let swapped = own.entry.status() == Status::Success;
        self.retire(own);
        if !swapped {
            self.stats.record_unavailable();
        }
        self.stats.record_completed();
        swapped
    }

    pub const fn len(&self) -> usize {
        N
    }

    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// `true` when no operation is in flight.
    pub fn is_idle(&self) -> bool {
        self.journal.load(Ordering::SeqCst) == NIL
    }

    /// Counters: `acquired` (operations started), `unavailable` (failed
    /// compare-exchanges), `completed`, `retries` (journal restarts, tail
    /// races and full slot-table scans) and `helped` (entries settled on
    /// behalf of other callers).
    pub fn stats(&self) -> Snapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    fn begin_read(&self) -> Held<'_, N> {
        let own = self.allocate();
        own.entry.kind.store(KIND_READ, Ordering::SeqCst);
        self.append(own.index);
        own
    }

    fn begin_compare_exchange(&self, expected: &[Word; N], desired: &[Word; N]) -> Held<'_, N> {
        let own = self.allocate();
        for (slot, &value) in own.entry.first.iter().zip(expected) {
            slot.store(value, Ordering::SeqCst);
        }
        for (slot, &value) in own.entry.second.iter().zip(desired) {
            slot.store(value, Ordering::SeqCst);
        }
        own.entry.kind.store(KIND_COMPARE_EXCHANGE, Ordering::SeqCst);
        self.append(own.index);
        own
    }

    /// Claim a free slot for a new entry.
    fn allocate(&self) -> Held<'_, N> {
        let mut scans = 0;
        loop {
            for (index, entry) in self.slots.iter().enumerate() {
                if entry
                    .refs
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    entry.next.store(NIL, Ordering::SeqCst);
                    entry.status.store(Status::Undefined as u8, Ordering::SeqCst);
                    self.stats.record_retries(scans);
                    return Held { entry, index };
                }
            }
            scans += 1;
            hint::spin_loop();
        }
    }

    fn hold(&self, index: usize) -> Held<'_, N> {
        let entry = &self.slots[index];
        entry.refs.fetch_add(1, Ordering::SeqCst);
        Held { entry, index }
    }

    /// Walk the journal from the head, unlinking retired entries on the way.
    ///
    /// `visit` sees every live entry in list order while it is held, then the
    /// terminating link. Returning `Continue` from `End` re-reads that link.
    fn scan<'m>(&'m self, mut visit: impl FnMut(Visit<'m, N>) -> Flow) {
        'restart: loop {
            let mut link_field: &'m AtomicUsize = &self.journal;
            // Keeps the entry owning `link_field` from being reused.
            let mut _pred: Option<Held<'m, N>> = None;
            loop {
                let link = link_field.load(Ordering::SeqCst);
                if is_marked(link) {
                    self.stats.record_retries(1);
                    continue 'restart;
                }
                let Some(index) = link_index(link) else {
                    match visit(Visit::End(link_field)) {
                        Flow::Stop => return,
                        Flow::Continue => continue,
                    }
                };

                let current = self.hold(index);
                let entry = current.entry;
                if link_field.load(Ordering::SeqCst) != link {
                    self.stats.record_retries(1);
                    continue 'restart;
                }

                let next = entry.next.load(Ordering::SeqCst);
                if is_marked(next) {
                    if link_field
                        .compare_exchange(link, next & !MARK, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        self.stats.record_retries(1);
                        continue 'restart;
                    }
                    continue;
                }

                if let Flow::Stop = visit(Visit::Entry(entry, index)) {
                    return;
                }
                link_field = &entry.next;
                _pred = Some(current);
            }
        }
    }

    fn append(&self, index: usize) {
        let link = link_to(index);
        self.scan(|visit| match visit {
            Visit::Entry(..) => Flow::Continue,
            Visit::End(tail) => {
                match tail.compare_exchange(NIL, link, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => Flow::Stop,
                    Err(_) => {
                        self.stats.record_retries(1);
                        Flow::Continue
                    }
                }
            }
        });
    }

    /// Complete every entry ahead of `own`, then `own` itself.
    fn finish(&self, own: &Held<'_, N>) {
        self.scan(|visit| match visit {
            Visit::Entry(entry, index) => {
                let settled = self.complete(entry);
                if index == own.index {
                    Flow::Stop
                } else {
                    if settled {
                        self.stats.record_helped();
                    }
                    Flow::Continue
                }
            }
            Visit::End(_) => Flow::Stop,
        });

        if !own.entry.status().is_settled() {
            fatal(Misuse::JournalStalled);
        }
    }

    /// Mark `own` retired, make sure it is unlinked and release the slot.
    fn retire(&self, own: Held<'_, N>) {
        own.entry.next.fetch_or(MARK, Ordering::SeqCst);
        // A full pass unlinks every retired entry it meets, `own` included.
        self.scan(|visit| match visit {
            Visit::Entry(..) => Flow::Continue,
            Visit::End(_) => Flow::Stop,
        });
        drop(own);
    }

    /// Settle `entry` if it is still open. Returns `true` if this call
    /// settled it.
    fn complete(&self, entry: &Entry<N>) -> bool {
        match entry.operation() {
            Operation::Read { dest } => self.complete_read(entry, dest),
            Operation::CompareExchange { expected, desired } => {
                self.complete_compare_exchange(entry, expected, desired)
            }
        }
    }

    fn complete_read(&self, entry: &Entry<N>, dest: &[AtomicIsize; N]) -> bool {
        for (word, slot) in self.words.iter().zip(dest) {
            let value = word.load(Ordering::SeqCst);
            if entry.status() != Status::Undefined {
                return false;
            }
            slot.store(value, Ordering::SeqCst);
        }
        entry.transition(Status::Undefined, Status::Success).is_ok()
    }

    fn complete_compare_exchange(
        &self,
        entry: &Entry<N>,
        expected: &[AtomicIsize; N],
        desired: &[AtomicIsize; N],
    ) -> bool {
        let mut status = entry.status();
        if status == Status::Undefined {
            let matches = self
                .words
                .iter()
                .zip(expected)
                .all(|(word, value)| word.load(Ordering::SeqCst) == value.load(Ordering::SeqCst));
            let decision = if matches { Status::Swapping } else { Status::Failure };
            status = match entry.transition(Status::Undefined, decision) {
                Ok(()) if decision == Status::Failure => return true,
                Ok(()) => Status::Swapping,
                Err(current) => current,
            };
        }
        if status != Status::Swapping {
            return false;
        }

        for ((word, from), to) in self.words.iter().zip(expected).zip(desired) {
            if entry.status() != Status::Swapping {
                return false;
            }
            // Already moved by another helper if this fails.
            let _ = word.compare_exchange(
                from.load(Ordering::SeqCst),
                to.load(Ordering::SeqCst),
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        entry.transition(Status::Swapping, Status::Success).is_ok()
    }
}

impl<const N: usize> Default for Mcas<N> {
    fn default() -> Self {
        Self::new([0; N])
    }
}

impl<const N: usize, const K: usize> fmt::Debug for Mcas<N, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mcas")
            .field("words", &self.read())
            .field("slots", &K)
            .field("idle", &self.is_idle())
            .finish()
    }
}
