//! # Thread Scheduler Interface
//!
//! The scheduling primitives the synchronization and storage layers are
//! built on.
//!
//! ## Design
//!
//! The core only needs four things from a scheduler:
//!
//! - a process-wide, non-reentrant critical section ([`Scheduler::enter`])
//! - a way to suspend the caller until it is explicitly resumed
//!   ([`CriticalSection::block`])
//! - a way to resume a specific suspended thread ([`CriticalSection::unblock`])
//! - a comparable thread identity with a "current" accessor ([`Tid`], [`current`])
//!
//! This implementation runs on OS threads. The critical section is a single
//! mutex; a blocked thread waits on a condition variable tied to that mutex,
//! so suspending atomically releases the section and resuming re-acquires it.
//! Resumptions are recorded as per-thread tokens, so an `unblock` delivered
//! before the target reaches `block` is not lost.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex, MutexGuard};

// ============================================================================
// Thread identity
// ============================================================================

/// Unique identifier for a thread known to the runtime.
///
/// Identifiers are assigned lazily on first use and never reused within a
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u64);

impl Tid {
    /// Rebuild a thread identifier from its raw value.
    ///
    /// Used at the C boundary, where identifiers travel as plain integers.
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Global thread ID counter. Zero is reserved for "no holder".
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TID: Tid = Tid(NEXT_TID.fetch_add(1, Ordering::Relaxed));
}

/// Get the identity of the calling thread.
pub fn current() -> Tid {
    CURRENT_TID.with(|tid| *tid)
}

// ============================================================================
// Scheduler
// ============================================================================

/// State protected by the critical section.
#[derive(Debug, Default)]
struct RunState {
    /// Threads that have been unblocked but not yet resumed.
    runnable: HashSet<Tid>,
    /// Number of threads currently suspended in `block`.
    blocked: usize,
}

/// Process-wide mutual exclusion plus block/unblock over OS threads.
pub struct Scheduler {
    /// The critical section itself.
    run_state: Mutex<RunState>,
    /// Signalled whenever a thread is made runnable.
    resumed: Condvar,
    /// Raw ID of the thread inside the section, 0 when free.
    holder: AtomicU64,
}

impl Scheduler {
    /// Create a new scheduler with a free critical section.
    pub fn new() -> Self {
        Self {
            run_state: Mutex::new(RunState::default()),
            resumed: Condvar::new(),
            holder: AtomicU64::new(0),
        }
    }

    /// Enter the critical section, blocking until it is free.
    ///
    /// The section is exited when the returned guard is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the section. The section is
    /// not reentrant and re-entry would otherwise deadlock.
    pub fn enter(&self) -> CriticalSection<'_> {
        let tid = current();
        if self.holder.load(Ordering::Acquire) == tid.0 {
            panic!("{tid} re-entered the critical section it already holds");
        }
        let guard = self.run_state.lock();
        self.holder.store(tid.0, Ordering::Release);
        CriticalSection {
            scheduler: self,
            guard,
            tid,
        }
    }

    /// Get the identity of the calling thread.
    pub fn current(&self) -> Tid {
        current()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let holder = self.holder.load(Ordering::Acquire);
        f.debug_struct("Scheduler")
            .field("holder", &(holder != 0).then_some(Tid(holder)))
            .finish()
    }
}

/// RAII guard for the critical section.
///
/// Holding one is proof that the current thread has exclusive access to all
/// state the runtime serializes through this scheduler.
pub struct CriticalSection<'a> {
    scheduler: &'a Scheduler,
    guard: MutexGuard<'a, RunState>,
    tid: Tid,
}

impl CriticalSection<'_> {
    /// Identity of the thread holding the section.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Suspend the calling thread until another thread unblocks it.
    ///
    /// The critical section is released while suspended and held again when
    /// this returns.
    pub fn block(&mut self) {
        self.guard.blocked += 1;
        while !self.guard.runnable.remove(&self.tid) {
            self.scheduler.holder.store(0, Ordering::Release);
            self.scheduler.resumed.wait(&mut self.guard);
            self.scheduler.holder.store(self.tid.0, Ordering::Release);
        }
        self.guard.blocked -= 1;
    }

    /// Mark `tid` runnable.
    ///
    /// If `tid` is not suspended yet, its next `block` returns immediately.
    pub fn unblock(&mut self, tid: Tid) {
        if self.guard.runnable.insert(tid) {
            self.scheduler.resumed.notify_all();
        }
    }

    /// Number of threads currently suspended in [`block`](Self::block).
    pub fn blocked(&self) -> usize {
        self.guard.blocked
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.scheduler.holder.store(0, Ordering::Release);
    }
}

impl fmt::Debug for CriticalSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalSection")
            .field("tid", &self.tid)
            .field("blocked", &self.guard.blocked)
            .finish()
    }
}

/// Process-wide scheduler instance.
static GLOBAL_SCHEDULER: OnceLock<Arc<Scheduler>> = OnceLock::new();

/// Get the process-wide scheduler.
///
/// Library code takes a scheduler explicitly; this instance backs the C ABI
/// and callers that want a single shared critical section.
pub fn global() -> &'static Arc<Scheduler> {
    GLOBAL_SCHEDULER.get_or_init(|| Arc::new(Scheduler::new()))
}
