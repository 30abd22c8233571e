use core::fmt;

/// Why an acquire-style operation could not hand out a slot right now.
///
/// All of these are transient: the caller may retry or back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// Every slot of a membag is currently allocated.
    Exhausted,
    /// A queue has no slot left to write into.
    Full,
    /// A queue has no committed slot left to read.
    Empty,
    /// Another context holds the writer side of a double buffer.
    WriterBusy,
}

impl AcquireError {
    pub fn as_str(self) -> &'static str {
        match self {
            AcquireError::Exhausted => "No free slot is available",
            AcquireError::Full => "Queue is full",
            AcquireError::Empty => "Queue is empty",
            AcquireError::WriterBusy => "Another writer holds the buffer",
        }
    }
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type AcquireResult<T> = Result<T, AcquireError>;

/// Protocol violations that are detected at runtime.
///
/// These are programming errors. They are never returned to the caller; they
/// are raised through [`fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    DoubleInit,
    ForeignSlot,
    OutOfOrderCommit,
    AppendToDeleting,
    DeleteTargetMissing,
    JournalStalled,
}

impl Misuse {
    pub fn as_str(self) -> &'static str {
        match self {
            Misuse::DoubleInit => "Membag initialized more than once",
            Misuse::ForeignSlot => "Slot handed back to a structure that does not own it",
            Misuse::OutOfOrderCommit => "FCFS commit does not match the oldest outstanding slot",
            Misuse::AppendToDeleting => "Node was appended to while it was being deleted",
            Misuse::DeleteTargetMissing => "Node to delete is not reachable from the anchor",
            Misuse::JournalStalled => "MCAS journal entry left unsettled after its walk",
        }
    }
}

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Abort the current operation because of a protocol violation.
#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn fatal(misuse: Misuse) -> ! {
    panic!("aint-safe: {}", misuse.as_str())
}
