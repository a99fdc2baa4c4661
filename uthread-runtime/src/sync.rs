//! # Synchronization Primitives
//!
//! Counting semaphore with an ordered wait list, built on the scheduler's
//! critical section and block/unblock primitives.
//!
//! ## Design Notes
//!
//! Every operation runs inside one acquisition of the critical section.
//! `down` is the only operation that may suspend: it appends the caller to
//! the wait list and blocks, which releases the section until an `up` wakes
//! it. On resume the count is checked again before a unit is taken, so a
//! woken thread that finds the count already spent simply waits again.
//!
//! `up` wakes exactly one waiter, the oldest, so blocked threads are granted
//! units in the order they started waiting. The count has no ceiling: `up`
//! may be called more often than `down`.
//!
//! A woken thread has left the wait list but is still inside `down` until it
//! re-enters the critical section. Such threads are counted as suspended, and
//! `destroy` refuses while any remain.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::ErrorKind;
use crate::queue::{Queue, QueueError};
use crate::scheduler::{Scheduler, Tid};

// ============================================================================
// Errors
// ============================================================================

/// Error returned by semaphore operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SemaphoreError {
    /// The semaphore was destroyed; the handle is no longer valid.
    #[error("semaphore has been destroyed")]
    Destroyed,
    /// Destroy was refused because threads are still waiting.
    #[error("cannot destroy semaphore: {0} thread(s) still waiting")]
    WaitersPending(usize),
    /// Storage for the wait list could not be obtained.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl SemaphoreError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SemaphoreError::Destroyed => ErrorKind::Validation,
            SemaphoreError::WaitersPending(_) => ErrorKind::State,
            SemaphoreError::Queue(err) => err.kind(),
        }
    }
}

// ============================================================================
// Semaphore
// ============================================================================

/// Live semaphore state. `None` in the owner once destroyed.
#[derive(Debug)]
struct SemaphoreState {
    /// Units currently available.
    count: usize,
    /// Threads blocked in `down`, oldest first.
    waiting: Queue<Tid>,
    /// Threads that have blocked in `down` and not yet returned from it,
    /// whether still queued or already woken.
    suspended: usize,
}

/// A counting semaphore with FIFO wakeup.
pub struct Semaphore {
    /// Unique semaphore ID for debugging.
    id: u64,
    /// Scheduler providing the critical section and blocking.
    scheduler: Arc<Scheduler>,
    /// Count and wait list; only touched inside the critical section.
    state: Mutex<Option<SemaphoreState>>,
}

impl Semaphore {
    /// Creates a new semaphore with `count` units available.
    pub fn new(scheduler: Arc<Scheduler>, count: usize) -> Result<Self, SemaphoreError> {
        Self::with_wait_capacity(scheduler, count, 0)
    }

    /// Creates a new semaphore whose wait list is pre-sized for `capacity`
    /// blocked threads.
    pub fn with_wait_capacity(
        scheduler: Arc<Scheduler>,
        count: usize,
        capacity: usize,
    ) -> Result<Self, SemaphoreError> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let waiting = {
            let _cs = scheduler.enter();
            Queue::with_capacity(capacity)?
        };
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(semaphore = id, count, "semaphore created");

        Ok(Self {
            id,
            scheduler,
            state: Mutex::new(Some(SemaphoreState {
                count,
                waiting,
                suspended: 0,
            })),
        })
    }

    /// Get the semaphore ID for debugging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Destroys the semaphore.
    ///
    /// Fails if it was already destroyed or if any thread is still inside
    /// `down`, including one that `up` has woken but that has not resumed
    /// yet. In the latter case the semaphore is left untouched.
    pub fn destroy(&self) -> Result<(), SemaphoreError> {
        let _cs = self.scheduler.enter();
        let mut guard = self.state.lock();
        let state = guard.as_ref().ok_or(SemaphoreError::Destroyed)?;
        if state.suspended > 0 {
            return Err(SemaphoreError::WaitersPending(state.suspended));
        }
        let state = guard.take().ok_or(SemaphoreError::Destroyed)?;

        match state.waiting.destroy() {
            Ok(()) => {
                debug!(semaphore = self.id, "semaphore destroyed");
                Ok(())
            }
            Err(waiting) => {
                let pending = waiting.len();
                *guard = Some(SemaphoreState {
                    count: state.count,
                    waiting,
                    suspended: state.suspended,
                });
                Err(SemaphoreError::WaitersPending(pending))
            }
        }
    }

    /// Takes one unit, blocking the current thread until one is available.
    pub fn down(&self) -> Result<(), SemaphoreError> {
        let mut cs = self.scheduler.enter();
        let tid = cs.tid();
        let mut suspended = false;

        loop {
            {
                let mut guard = self.state.lock();
                let state = guard.as_mut().ok_or(SemaphoreError::Destroyed)?;
                if state.count > 0 {
                    state.count -= 1;
                    if suspended {
                        state.suspended -= 1;
                    }
                    return Ok(());
                }
                // A wakeup that did not come from `up` leaves us queued.
                if state.waiting.find(|&waiter| waiter == tid).is_none() {
                    if let Err(err) = state.waiting.enqueue(tid) {
                        if suspended {
                            state.suspended -= 1;
                        }
                        return Err(err.into());
                    }
                }
                if !suspended {
                    state.suspended += 1;
                    suspended = true;
                }
            }

            trace!(semaphore = self.id, %tid, "blocking on semaphore");
            cs.block();
        }
    }

    /// Takes one unit if available without blocking.
    ///
    /// Returns `true` if a unit was taken.
    pub fn try_down(&self) -> Result<bool, SemaphoreError> {
        let _cs = self.scheduler.enter();
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(SemaphoreError::Destroyed)?;
        if state.count == 0 {
            return Ok(false);
        }
        state.count -= 1;
        Ok(true)
    }

    /// Releases one unit and wakes the oldest waiter, if any.
    pub fn up(&self) -> Result<(), SemaphoreError> {
        let mut cs = self.scheduler.enter();
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(SemaphoreError::Destroyed)?;

        state.count = state.count.saturating_add(1);
        if let Some(waiter) = state.waiting.dequeue() {
            trace!(semaphore = self.id, tid = %waiter, "waking waiter");
            cs.unblock(waiter);
        }
        Ok(())
    }

    /// Get the number of units currently available.
    pub fn count(&self) -> Result<usize, SemaphoreError> {
        let _cs = self.scheduler.enter();
        let guard = self.state.lock();
        guard
            .as_ref()
            .map(|state| state.count)
            .ok_or(SemaphoreError::Destroyed)
    }

    /// Get the number of threads waiting for a unit.
    pub fn waiters(&self) -> Result<usize, SemaphoreError> {
        let _cs = self.scheduler.enter();
        let guard = self.state.lock();
        guard
            .as_ref()
            .map(|state| state.waiting.len())
            .ok_or(SemaphoreError::Destroyed)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Semaphore");
        debug.field("id", &self.id);
        match self.state.try_lock().as_deref() {
            Some(Some(state)) => debug
                .field("count", &state.count)
                .field("waiting", &state.waiting.len()),
            Some(None) => debug.field("destroyed", &true),
            None => debug.field("state", &"<locked>"),
        };
        debug.finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
