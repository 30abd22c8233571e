//! Simulated interrupts for exercising the structures on a hosted target.
//!
//! [`Preemption::start`] installs a `SIGUSR1` handler and spawns a ticker
//! thread that keeps signalling the calling thread. Every signal runs the
//! registered handler to completion on top of whatever the calling thread was
//! doing, which is exactly how an interrupt preempts a task on one core. With
//! [`PreemptionConfig::nesting`] the signal stays unblocked inside its own
//! handler, so handlers can be preempted by further handlers.
//!
//! Only one harness can be active per process; a second `start` waits for the
//! first harness to stop.

use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::ptr;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

static SERIAL: Mutex<()> = Mutex::new(());

/// Registered `fn()` as an address; zero when none
static HANDLER: AtomicUsize = AtomicUsize::new(0);
static INTERRUPTS: AtomicUsize = AtomicUsize::new(0);
static DEPTH: AtomicUsize = AtomicUsize::new(0);
static MAX_DEPTH: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptionConfig {
    /// Pause between two signals; zero only yields
    pub interval_us: u64,
    /// Allow a handler to be interrupted by the next signal
    pub nesting: bool,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            interval_us: 50,
            nesting: true,
        }
    }
}

extern "C" fn on_signal(_sig: libc::c_int) {
    // Only atomics in here: this runs on top of arbitrary code.
    let depth = DEPTH.fetch_add(1, Ordering::SeqCst) + 1;
    MAX_DEPTH.fetch_max(depth, Ordering::Relaxed);
    INTERRUPTS.fetch_add(1, Ordering::Relaxed);

    let raw = HANDLER.load(Ordering::SeqCst);
    if raw != 0 {
        // SAFETY: HANDLER only ever holds zero or a `fn()` stored by `start`.
        let handler = unsafe { mem::transmute::<usize, fn()>(raw) };
        handler();
    }

    DEPTH.fetch_sub(1, Ordering::SeqCst);
}

/// Active interrupt simulator targeting the thread that started it.
///
/// Must be stopped (or dropped) on that same thread, before it exits.
pub struct Preemption {
    stop: Arc<AtomicBool>,
    ticker: Option<JoinHandle<()>>,
    previous: libc::sigaction,
    _serial: MutexGuard<'static, ()>,
    // Stays on the target thread.
    _not_send: PhantomData<*const ()>,
}

impl Preemption {
    /// Start interrupting the calling thread with `handler`.
    pub fn start(handler: fn(), config: PreemptionConfig) -> Result<Self, &'static str> {
        let serial = SERIAL.lock();
        HANDLER.store(handler as usize, Ordering::SeqCst);
        INTERRUPTS.store(0, Ordering::Relaxed);
        MAX_DEPTH.store(0, Ordering::Relaxed);

        let previous = unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = libc::SA_RESTART;
            if config.nesting {
                action.sa_flags |= libc::SA_NODEFER;
            }
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;

            let mut previous = MaybeUninit::<libc::sigaction>::uninit();
            if libc::sigaction(libc::SIGUSR1, &action, previous.as_mut_ptr()) == -1 {
                HANDLER.store(0, Ordering::SeqCst);
                return Err("Failed to install signal handler");
            }
            previous.assume_init()
        };

        let target = unsafe { libc::pthread_self() };
        let stop = Arc::new(AtomicBool::new(false));
        let interval = Duration::from_micros(config.interval_us);
        let ticker = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("preemption-ticker".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        unsafe {
                            libc::pthread_kill(target, libc::SIGUSR1);
                        }
                        if interval.is_zero() {
                            thread::yield_now();
                        } else {
                            thread::sleep(interval);
                        }
                    }
                })
        };

        match ticker {
            Ok(ticker) => Ok(Self {
                stop,
                ticker: Some(ticker),
                previous,
                _serial: serial,
                _not_send: PhantomData,
            }),
            Err(_) => {
                unsafe {
                    libc::sigaction(libc::SIGUSR1, &previous, ptr::null_mut());
                }
                HANDLER.store(0, Ordering::SeqCst);
                Err("Failed to spawn ticker thread")
            }
        }
    }

    /// Handler entries since `start`.
    pub fn interrupts(&self) -> usize {
        INTERRUPTS.load(Ordering::Relaxed)
    }

    /// Deepest handler nesting seen since `start`.
    pub fn max_depth(&self) -> usize {
        MAX_DEPTH.load(Ordering::Relaxed)
    }

    /// Stop interrupting and return the number of handler entries.
    pub fn stop(mut self) -> usize {
        self.shutdown();
        self.interrupts()
    }

    fn shutdown(&mut self) {
        let Some(ticker) = self.ticker.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // Signals sent before the ticker exits are delivered by the time the
        // join returns to this thread.
        let _ = ticker.join();
        unsafe {
            libc::sigaction(libc::SIGUSR1, &self.previous, ptr::null_mut());
        }
        HANDLER.store(0, Ordering::SeqCst);
    }
}

impl Drop for Preemption {
    fn drop(&mut self) {
        self.shutdown();
    }
}
