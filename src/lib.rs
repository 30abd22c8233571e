//! Interrupt-safe, allocation-free lock-free data structures.
//!
//! Every structure here stays correct when any of its operations is
//! preempted at any instruction by another operation on the same structure,
//! for instance by an interrupt handler, without ever masking interrupts.
//! All storage is fixed at construction and constructors are `const`, so the
//! structures can live in `static`s shared between a task and its handlers.
//!
//! - [`Membag`]: fixed-capacity slot allocator
//! - [`DoubleBuffer`]: latest-value mailbox, one writer and nested readers
//! - [`Mcas`]: multi-word compare-and-swap built on a helping journal
//! - [`NestedQueue`]: bounded MPMC ring queue on top of [`Mcas`]
//! - [`Node`]: intrusive singly linked list with tombstoned deletion

#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod double_buffer;
pub mod error;
pub mod mcas;
pub mod membag;
pub mod nested_queue;
pub mod platform;
pub mod slist;
pub mod stats;

#[cfg(all(feature = "std", target_os = "linux"))]
pub mod preemption;

pub use double_buffer::DoubleBuffer;
pub use error::{AcquireError, AcquireResult, Misuse};
pub use mcas::Mcas;
pub use membag::Membag;
pub use nested_queue::{CommitOrder, NestedQueue, QueueConfig};
pub use slist::Node;
pub use stats::Snapshot;
