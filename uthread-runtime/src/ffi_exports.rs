//! # FFI Exports
//!
//! C-compatible exports for programs that link against the runtime.
//!
//! ## Design
//!
//! Every export goes through the process-wide scheduler and a process-wide
//! TPS registry, so C callers on different threads share one critical
//! section. Status-returning functions return 0 on success and -1 on any
//! failure; the reason is logged at debug level.
//!
//! ## Usage
//!
//! The crate builds a staticlib alongside the rlib; link C programs with
//! `-luthread_runtime`.
//!
//! Semaphore exports carry a `uthread_` prefix because the plain `sem_*`
//! names belong to POSIX semaphores in libc and would resolve by link order.

use std::ffi::{c_char, c_int};
use std::fmt::Display;
use std::ptr;
use std::slice;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::page::check_range;
use crate::scheduler::{self, Tid};
use crate::sync::Semaphore;
use crate::tps::{TpsError, TpsRegistry};

static REGISTRY: OnceLock<TpsRegistry> = OnceLock::new();

/// The process-wide TPS registry behind the `tps_*` exports.
pub fn registry() -> &'static TpsRegistry {
    REGISTRY.get_or_init(|| TpsRegistry::new(Arc::clone(scheduler::global())))
}

fn status<E: Display>(op: &'static str, result: Result<(), E>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            debug!(op, %err, "call failed");
            -1
        }
    }
}

// ============================================================================
// Threads
// ============================================================================

/// Identifier of the calling thread, as accepted by [`tps_clone`].
#[no_mangle]
pub extern "C" fn uthread_self() -> u64 {
    scheduler::current().as_u64()
}

// ============================================================================
// Semaphores
// ============================================================================

/// Create a semaphore with `count` units.
///
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn uthread_sem_create(count: usize) -> *mut Semaphore {
    match Semaphore::new(Arc::clone(scheduler::global()), count) {
        Ok(sem) => Box::into_raw(Box::new(sem)),
        Err(err) => {
            debug!(op = "uthread_sem_create", %err, "call failed");
            ptr::null_mut()
        }
    }
}

/// Destroy a semaphore and free it.
///
/// Fails, leaving the semaphore usable, while any thread is inside
/// [`uthread_sem_down`] on it, including a waiter already woken by
/// [`uthread_sem_up`].
///
/// # Safety
///
/// `sem` must be null or a handle from [`uthread_sem_create`] that has not
/// been successfully destroyed. After this returns 0 the handle is dangling.
#[no_mangle]
pub unsafe extern "C" fn uthread_sem_destroy(sem: *mut Semaphore) -> c_int {
    if sem.is_null() {
        return -1;
    }
    // SAFETY: non-null handles come from `uthread_sem_create` per the contract.
    let result = unsafe { (*sem).destroy() };
    if result.is_ok() {
        // SAFETY: destroy succeeds only once no thread is inside `down`, and
        // the contract forbids further use of the handle.
        drop(unsafe { Box::from_raw(sem) });
    }
    status("uthread_sem_destroy", result)
}

/// Take one unit, blocking while none are available.
///
/// # Safety
///
/// `sem` must be null or a live handle from [`uthread_sem_create`].
#[no_mangle]
pub unsafe extern "C" fn uthread_sem_down(sem: *mut Semaphore) -> c_int {
    // SAFETY: live handle per the contract.
    match unsafe { sem.as_ref() } {
        Some(sem) => status("uthread_sem_down", sem.down()),
        None => -1,
    }
}

/// Release one unit, waking the oldest waiter.
///
/// # Safety
///
/// `sem` must be null or a live handle from [`uthread_sem_create`].
#[no_mangle]
pub unsafe extern "C" fn uthread_sem_up(sem: *mut Semaphore) -> c_int {
    // SAFETY: live handle per the contract.
    match unsafe { sem.as_ref() } {
        Some(sem) => status("uthread_sem_up", sem.up()),
        None => -1,
    }
}

// ============================================================================
// Thread-Private Storage
// ============================================================================

/// Initialize the TPS registry. A non-zero `segv` installs the fault handler.
#[no_mangle]
pub extern "C" fn tps_init(segv: c_int) -> c_int {
    status("tps_init", registry().init(segv != 0))
}

/// Give the calling thread a zeroed TPS area.
#[no_mangle]
pub extern "C" fn tps_create() -> c_int {
    status("tps_create", registry().create())
}

/// Release the calling thread's TPS area.
#[no_mangle]
pub extern "C" fn tps_destroy() -> c_int {
    status("tps_destroy", registry().destroy())
}

/// Read `length` bytes at `offset` of the caller's TPS area into `buffer`.
///
/// # Safety
///
/// `buffer` must be null or valid for writes of `length` bytes.
#[no_mangle]
pub unsafe extern "C" fn tps_read(offset: usize, length: usize, buffer: *mut c_char) -> c_int {
    let result = if buffer.is_null() {
        Err(TpsError::MissingBuffer)
    } else if check_range(offset, length).is_err() {
        Err(TpsError::OutOfBounds { offset, length })
    } else {
        // SAFETY: valid for `length` bytes per the contract.
        let buf = unsafe { slice::from_raw_parts_mut(buffer.cast::<u8>(), length) };
        registry().read(offset, length, buf)
    };
    status("tps_read", result)
}

/// Write `length` bytes of `buffer` into the caller's TPS area at `offset`.
///
/// # Safety
///
/// `buffer` must be null or valid for reads of `length` bytes.
#[no_mangle]
pub unsafe extern "C" fn tps_write(offset: usize, length: usize, buffer: *const c_char) -> c_int {
    let result = if buffer.is_null() {
        Err(TpsError::MissingBuffer)
    } else if check_range(offset, length).is_err() {
        Err(TpsError::OutOfBounds { offset, length })
    } else {
        // SAFETY: valid for `length` bytes per the contract.
        let buf = unsafe { slice::from_raw_parts(buffer.cast::<u8>(), length) };
        registry().write(offset, length, buf)
    };
    status("tps_write", result)
}

/// Give the calling thread a TPS area sharing thread `tid`'s page.
#[no_mangle]
pub extern "C" fn tps_clone(tid: u64) -> c_int {
    status("tps_clone", registry().clone_tps(Tid::from_u64(tid)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_null_handles_fail() {
        unsafe {
            assert_eq!(uthread_sem_destroy(ptr::null_mut()), -1);
            assert_eq!(uthread_sem_down(ptr::null_mut()), -1);
            assert_eq!(uthread_sem_up(ptr::null_mut()), -1);
        }
    }

    #[test]
    fn test_semaphore_lifecycle() {
        let sem = uthread_sem_create(1);
        assert!(!sem.is_null());
        unsafe {
            assert_eq!(uthread_sem_down(sem), 0);
            assert_eq!(uthread_sem_up(sem), 0);
            assert_eq!(uthread_sem_destroy(sem), 0);
        }
    }

    #[test]
    fn test_destroy_waits_for_woken_waiter() {
        for _ in 0..50 {
            let sem = uthread_sem_create(0);
            assert!(!sem.is_null());
            let handle = sem as usize;
            let waiter =
                thread::spawn(move || unsafe { uthread_sem_down(handle as *mut Semaphore) });

            // SAFETY: the handle stays live until the destroy below succeeds.
            let sem_ref = unsafe { &*sem };
            while sem_ref.waiters().unwrap() == 0 {
                thread::yield_now();
            }

            unsafe {
                assert_eq!(uthread_sem_up(sem), 0);
                while uthread_sem_destroy(sem) != 0 {
                    thread::yield_now();
                }
            }
            assert_eq!(waiter.join().unwrap(), 0);
        }
    }

    #[test]
    fn test_uthread_self_is_stable() {
        let me = uthread_self();
        assert_eq!(uthread_self(), me);
        let other = thread::spawn(|| uthread_self()).join().unwrap();
        assert_ne!(other, me);
    }

    // The only test in this crate that touches the global registry.
    #[test]
    fn test_tps_exports() {
        assert_eq!(tps_create(), -1);
        assert_eq!(tps_init(0), 0);
        assert_eq!(tps_init(0), -1);

        let owner = thread::spawn(|| {
            let msg = b"Hello World!\n";
            assert_eq!(tps_create(), 0);
            assert_eq!(tps_create(), -1);
            unsafe {
                assert_eq!(tps_write(0, msg.len(), msg.as_ptr().cast()), 0);
                assert_eq!(tps_write(0, 1, ptr::null()), -1);
                assert_eq!(tps_write(4096, 1, msg.as_ptr().cast()), -1);
            }
            uthread_self()
        })
        .join()
        .unwrap();

        thread::spawn(move || {
            let mut buf = [0u8; 13];
            assert_eq!(tps_clone(owner), 0);
            unsafe {
                assert_eq!(tps_read(0, buf.len(), buf.as_mut_ptr().cast()), 0);
                assert_eq!(tps_read(0, 1, ptr::null_mut()), -1);
            }
            assert_eq!(&buf, b"Hello World!\n");
            assert_eq!(tps_destroy(), 0);
            assert_eq!(tps_destroy(), -1);
        })
        .join()
        .unwrap();

        assert_eq!(tps_clone(u64::MAX), -1);
    }
}
