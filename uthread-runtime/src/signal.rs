//! Fault Handling
//!
//! This module attributes illegal memory accesses to TPS pages. It keeps a
//! process-wide index of live page base addresses and, when asked, installs a
//! handler for SIGSEGV and SIGBUS that consults it.
//!
//! # Handler behaviour
//!
//! On a fault the handler rounds the faulting address down to its page base
//! and scans the live index. If the page is a TPS page it writes
//! `TPS protection error!` to stderr. In every case it then restores the
//! default disposition for both signals and re-raises, so the process dies
//! the way it would have without the handler. Nothing is recovered.
//!
//! # Signal safety
//!
//! The index is a chain of fixed-size chunks of atomics, so the handler can
//! scan it without allocating or taking locks, and the diagnostic goes out
//! through a raw `write(2)`. When every slot is taken, `track_page` appends a
//! new chunk, so allocation happens at map time and never in the handler.
//! Chunks live for the rest of the process; freed slots are reused.
//!
//! The handler runs with `SA_ONSTACK`, on the alternate stack std sets up
//! for its threads. It replaces std's stack-overflow handler, so an overflow
//! dies by SIGSEGV without std's "stack overflow" message.
//!
//! # Usage
//!
//! ```rust,ignore
//! use uthread_runtime::signal;
//!
//! signal::install_fault_handler()?;
//! assert!(signal::fault_handler_installed());
//! ```

use std::ffi::{c_int, c_void};
use std::iter;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use crate::page::TPS_SIZE;

/// Slots in each chunk of the live index.
const SLOTS_PER_CHUNK: usize = 512;

/// Diagnostic written when a fault hits a TPS page.
pub const PROTECTION_ERROR_MESSAGE: &str = "TPS protection error!\n";

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicUsize = AtomicUsize::new(0);

/// One link of the live index.
struct Chunk {
    /// Base addresses of live TPS pages; 0 marks a free slot.
    slots: [AtomicUsize; SLOTS_PER_CHUNK],
    /// Next chunk, null at the tail. Never reset once set.
    next: AtomicPtr<Chunk>,
}

impl Chunk {
    const fn new() -> Self {
        Self {
            slots: [EMPTY_SLOT; SLOTS_PER_CHUNK],
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn claim(&self, base: usize) -> bool {
        self.slots.iter().any(|slot| {
            slot.compare_exchange(0, base, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    fn next(&self) -> Option<&'static Chunk> {
        // SAFETY: non-null links point at leaked chunks that are never freed.
        unsafe { self.next.load(Ordering::Acquire).as_ref() }
    }
}

/// Head of the live index.
static LIVE_PAGES: Chunk = Chunk::new();

/// Whether the fault handler has been installed.
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// All slots of the live index. Async-signal-safe.
fn slots() -> impl Iterator<Item = &'static AtomicUsize> {
    iter::successors(Some(&LIVE_PAGES), |chunk| chunk.next()).flat_map(|chunk| chunk.slots.iter())
}

// ============================================================================
// Live page index
// ============================================================================

/// Record `base` as a live TPS page, growing the index if it is full.
pub fn track_page(base: usize) {
    let mut chunk: &'static Chunk = &LIVE_PAGES;
    loop {
        if chunk.claim(base) {
            return;
        }
        if let Some(next) = chunk.next() {
            chunk = next;
            continue;
        }

        let fresh = Box::into_raw(Box::new(Chunk::new()));
        match chunk
            .next
            .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(slots = SLOTS_PER_CHUNK, "live page index grown");
                // SAFETY: just linked; chunks are never freed.
                chunk = unsafe { &*fresh };
            }
            Err(existing) => {
                // SAFETY: `fresh` was never shared.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: another thread linked a leaked chunk.
                chunk = unsafe { &*existing };
            }
        }
    }
}

/// Forget `base`. Unknown addresses are ignored.
pub fn untrack_page(base: usize) {
    for slot in slots() {
        if slot
            .compare_exchange(base, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Whether `base` is a live TPS page.
///
/// Async-signal-safe.
pub fn is_tracked(base: usize) -> bool {
    base != 0 && slots().any(|slot| slot.load(Ordering::Acquire) == base)
}

/// Number of live pages currently in the index.
pub fn tracked_pages() -> usize {
    slots()
        .filter(|slot| slot.load(Ordering::Acquire) != 0)
        .count()
}

// ============================================================================
// Fault handler
// ============================================================================

/// Install the fault handler for SIGSEGV and SIGBUS.
///
/// Returns `Ok(true)` if the handler was installed by this call and
/// `Ok(false)` if it was already in place.
pub fn install_fault_handler() -> Result<bool, nix::Error> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }

    let action = SigAction::new(
        SigHandler::SigAction(fault_handler),
        SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    );
    for sig in [Signal::SIGBUS, Signal::SIGSEGV] {
        // SAFETY: the handler only performs async-signal-safe operations.
        if let Err(err) = unsafe { sigaction(sig, &action) } {
            INSTALLED.store(false, Ordering::SeqCst);
            return Err(err);
        }
    }

    debug!("TPS fault handler installed");
    Ok(true)
}

/// Whether the fault handler is installed.
pub fn fault_handler_installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

/// Page base that contains `addr`.
pub fn page_base(addr: usize) -> usize {
    addr & !(TPS_SIZE - 1)
}

extern "C" fn fault_handler(sig: c_int, info: *mut libc::siginfo_t, _context: *mut c_void) {
    let addr = if info.is_null() {
        0
    } else {
        // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
        unsafe { fault_address(&*info) }
    };

    if is_tracked(page_base(addr)) {
        let msg = PROTECTION_ERROR_MESSAGE.as_bytes();
        // SAFETY: write(2) is async-signal-safe; the buffer is static.
        unsafe {
            libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        }
    }

    // SAFETY: signal(2) and raise(3) are async-signal-safe.
    unsafe {
        libc::signal(libc::SIGSEGV, libc::SIG_DFL);
        libc::signal(libc::SIGBUS, libc::SIG_DFL);
        libc::raise(sig);
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: &libc::siginfo_t) -> usize {
    info.si_addr() as usize
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: &libc::siginfo_t) -> usize {
    info.si_addr as usize
}
