//! Build-time check that the target has native lock-free atomics.
//!
//! Every structure in this crate stays correct while interrupts are enabled
//! only because its atomics never fall back to a lock or to masking
//! interrupts. A target that cannot provide them must fail to build.

use portable_atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU8, AtomicUsize};

#[cfg(portable_atomic_unsafe_assume_single_core)]
compile_error!(
    "aint-safe cannot be built with portable_atomic_unsafe_assume_single_core: \
     that mode implements atomics by disabling interrupts"
);

/// `true` when every atomic width used by the crate is natively lock-free.
pub const LOCK_FREE: bool = AtomicBool::is_always_lock_free()
    && AtomicU8::is_always_lock_free()
    && AtomicUsize::is_always_lock_free()
    && AtomicIsize::is_always_lock_free()
    && AtomicPtr::<()>::is_always_lock_free();

const _: () = assert!(
    AtomicUsize::is_always_lock_free() && AtomicIsize::is_always_lock_free(),
    "target has no lock-free atomics for the machine word"
);
const _: () = assert!(
    AtomicPtr::<()>::is_always_lock_free(),
    "target has no lock-free pointer atomics"
);
const _: () = assert!(
    AtomicBool::is_always_lock_free() && AtomicU8::is_always_lock_free(),
    "target has no lock-free byte atomics"
);
