//! # Thread-Private Storage
//!
//! Each thread may own one TPS area: a single protected [`Page`] that only
//! the owner reads and writes, and only through [`TpsRegistry::read`] and
//! [`TpsRegistry::write`].
//!
//! ## Sharing
//!
//! [`TpsRegistry::clone_tps`] gives the caller a record that shares the donor's
//! page instead of copying it. The first write by either sharer duplicates
//! the page into a private one for the writer (copy-on-write), so the other
//! sharers never observe the change.
//!
//! ## Serialization
//!
//! Every operation runs inside the scheduler's critical section. Page
//! protection applies to the whole process, so serializing the windows is
//! what keeps one thread's bracket from exposing a page to another.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use uthread_runtime::{Scheduler, TpsRegistry};
//!
//! let tps = TpsRegistry::new(Arc::new(Scheduler::new()));
//! tps.init(true)?;
//! tps.create()?;
//! tps.write(0, 5, b"Hello")?;
//!
//! let mut buf = [0u8; 5];
//! tps.read(0, 5, &mut buf)?;
//! assert_eq!(&buf, b"Hello");
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;
use crate::page::{check_range, Page, PageError, Protection, TPS_SIZE};
use crate::queue::{Queue, QueueError};
use crate::scheduler::{Scheduler, Tid};
use crate::signal;

// ============================================================================
// Errors
// ============================================================================

/// Error returned by TPS operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TpsError {
    /// `init` was called on a registry that is already initialized.
    #[error("thread-private storage is already initialized")]
    AlreadyInitialized,
    /// An operation was attempted before `init`.
    #[error("thread-private storage is not initialized")]
    NotInitialized,
    /// The caller already owns a TPS area.
    #[error("{0} already owns a TPS area")]
    AlreadyExists(Tid),
    /// The caller owns no TPS area.
    #[error("{0} owns no TPS area")]
    NotFound(Tid),
    /// The clone donor owns no TPS area.
    #[error("clone donor {0} owns no TPS area")]
    DonorNotFound(Tid),
    /// The byte range does not fit in the TPS area.
    #[error("access of {length} bytes at offset {offset} exceeds the {}-byte TPS area", TPS_SIZE)]
    OutOfBounds {
        /// Start of the range.
        offset: usize,
        /// Length of the range.
        length: usize,
    },
    /// No buffer was supplied.
    #[error("no buffer supplied")]
    MissingBuffer,
    /// The supplied buffer is shorter than the requested length.
    #[error("buffer holds {actual} bytes but {required} were requested")]
    BufferTooSmall {
        /// Bytes requested.
        required: usize,
        /// Bytes the buffer holds.
        actual: usize,
    },
    /// The fault handler could not be installed.
    #[error("failed to install the TPS fault handler: {0}")]
    FaultHandler(#[source] nix::Error),
    /// A page operation failed.
    #[error(transparent)]
    Page(#[from] PageError),
    /// The registry could not grow.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl TpsError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TpsError::AlreadyInitialized | TpsError::NotInitialized | TpsError::NotFound(_) => {
                ErrorKind::State
            }
            TpsError::AlreadyExists(_)
            | TpsError::DonorNotFound(_)
            | TpsError::OutOfBounds { .. }
            | TpsError::MissingBuffer
            | TpsError::BufferTooSmall { .. } => ErrorKind::Validation,
            TpsError::FaultHandler(_) => ErrorKind::ResourceExhaustion,
            TpsError::Page(err) => err.kind(),
            TpsError::Queue(err) => err.kind(),
        }
    }
}

/// Validate a `length`-byte access at `offset` through a buffer of
/// `buffer_len` bytes.
fn check_access(offset: usize, length: usize, buffer_len: usize) -> Result<(), TpsError> {
    check_range(offset, length).map_err(|_| TpsError::OutOfBounds { offset, length })?;
    if buffer_len < length {
        return Err(TpsError::BufferTooSmall {
            required: length,
            actual: buffer_len,
        });
    }
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

/// One thread's TPS area.
#[derive(Debug)]
struct TpsRecord {
    /// Owning thread.
    tid: Tid,
    /// Backing page, possibly shared with clones.
    page: Arc<Page>,
}

/// Registry of TPS areas, keyed by owning thread.
pub struct TpsRegistry {
    /// Scheduler providing the critical section.
    scheduler: Arc<Scheduler>,
    /// Records; `None` until `init`.
    records: Mutex<Option<Queue<TpsRecord>>>,
}

impl TpsRegistry {
    /// Create an uninitialized registry serialized by `scheduler`.
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            records: Mutex::new(None),
        }
    }

    /// Initialize the registry.
    ///
    /// With `install_fault_diagnostics`, installs the process-wide handler
    /// that reports faults on TPS pages before the process dies. Fails if the
    /// registry is already initialized.
    pub fn init(&self, install_fault_diagnostics: bool) -> Result<(), TpsError> {
        let _cs = self.scheduler.enter();
        let mut records = self.records.lock();
        if records.is_some() {
            return Err(TpsError::AlreadyInitialized);
        }

        if install_fault_diagnostics {
            signal::install_fault_handler().map_err(TpsError::FaultHandler)?;
        }

        *records = Some(Queue::new());
        debug!(fault_diagnostics = install_fault_diagnostics, "TPS registry initialized");
        Ok(())
    }

    /// Whether `init` has succeeded.
    pub fn is_initialized(&self) -> bool {
        let _cs = self.scheduler.enter();
        self.records.lock().is_some()
    }

    /// Run `f` on the records inside the critical section.
    fn with_records<R>(
        &self,
        f: impl FnOnce(Tid, &mut Queue<TpsRecord>) -> Result<R, TpsError>,
    ) -> Result<R, TpsError> {
        let cs = self.scheduler.enter();
        let mut records = self.records.lock();
        let records = records.as_mut().ok_or(TpsError::NotInitialized)?;
        f(cs.tid(), records)
    }

    /// Give the calling thread a fresh, zeroed TPS area.
    pub fn create(&self) -> Result<(), TpsError> {
        self.with_records(|tid, records| {
            if records.find(|record| record.tid == tid).is_some() {
                return Err(TpsError::AlreadyExists(tid));
            }

            let page = Arc::new(Page::map()?);
            debug!(%tid, address = page.address(), "TPS created");
            records.enqueue(TpsRecord { tid, page })?;
            Ok(())
        })
    }

    /// Release the calling thread's TPS area.
    ///
    /// The page is unmapped if no clone still shares it.
    pub fn destroy(&self) -> Result<(), TpsError> {
        self.with_records(|tid, records| {
            let record = records
                .delete(|record| record.tid == tid)
                .ok_or(TpsError::NotFound(tid))?;
            debug!(
                %tid,
                remaining_sharers = Arc::strong_count(&record.page) - 1,
                "TPS destroyed"
            );
            Ok(())
        })
    }

    /// Copy `length` bytes at `offset` of the caller's TPS area into `buf`.
    pub fn read(&self, offset: usize, length: usize, buf: &mut [u8]) -> Result<(), TpsError> {
        self.with_records(|tid, records| {
            check_access(offset, length, buf.len())?;
            let record = records
                .find(|record| record.tid == tid)
                .ok_or(TpsError::NotFound(tid))?;
            record.page.read_at(offset, &mut buf[..length])?;
            Ok(())
        })
    }

    /// Copy `length` bytes of `buf` into the caller's TPS area at `offset`.
    ///
    /// If the area is shared with clones, the caller first gets a private
    /// copy of the page.
    pub fn write(&self, offset: usize, length: usize, buf: &[u8]) -> Result<(), TpsError> {
        self.with_records(|tid, records| {
            check_access(offset, length, buf.len())?;
            let record = records
                .find_mut(|record| record.tid == tid)
                .ok_or(TpsError::NotFound(tid))?;

            if Arc::strong_count(&record.page) > 1 {
                let private = record.page.duplicate()?;
                debug!(
                    %tid,
                    from = record.page.address(),
                    to = private.address(),
                    "TPS copy-on-write"
                );
                record.page = Arc::new(private);
            }

            record.page.write_at(offset, &buf[..length])?;
            Ok(())
        })
    }

    /// Give the calling thread a TPS area sharing `donor`'s page.
    ///
    /// No data is copied until one of the sharers writes.
    pub fn clone_tps(&self, donor: Tid) -> Result<(), TpsError> {
        self.with_records(|tid, records| {
            if records.find(|record| record.tid == tid).is_some() {
                return Err(TpsError::AlreadyExists(tid));
            }

            let page = records
                .find(|record| record.tid == donor)
                .map(|record| Arc::clone(&record.page))
                .ok_or(TpsError::DonorNotFound(donor))?;
            debug!(%tid, %donor, sharers = Arc::strong_count(&page), "TPS cloned");
            records.enqueue(TpsRecord { tid, page })?;
            Ok(())
        })
    }

    /// Find the thread whose TPS page contains `addr`.
    pub fn find_by_address(&self, addr: usize) -> Result<Option<Tid>, TpsError> {
        let base = signal::page_base(addr);
        self.with_records(|_, records| {
            Ok(records
                .find(|record| record.page.address() == base)
                .map(|record| record.tid))
        })
    }

    /// Base address of the caller's TPS page.
    ///
    /// Touching this address directly is a protection violation; it is
    /// exposed for diagnostics.
    pub fn page_address(&self) -> Result<usize, TpsError> {
        self.with_caller_page(|page| page.address())
    }

    /// Number of TPS areas sharing the caller's page, including the caller.
    pub fn page_refcount(&self) -> Result<usize, TpsError> {
        self.with_caller_page(|page| Arc::strong_count(page))
    }

    /// Protection currently applied to the caller's page.
    pub fn page_protection(&self) -> Result<Protection, TpsError> {
        self.with_caller_page(|page| page.protection())
    }

    fn with_caller_page<R>(&self, f: impl FnOnce(&Arc<Page>) -> R) -> Result<R, TpsError> {
        self.with_records(|tid, records| {
            records
                .find(|record| record.tid == tid)
                .map(|record| f(&record.page))
                .ok_or(TpsError::NotFound(tid))
        })
    }

    /// Number of live TPS areas. Zero before `init`.
    pub fn len(&self) -> usize {
        self.with_records(|_, records| Ok(records.len())).unwrap_or(0)
    }

    /// Whether no TPS areas are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TpsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TpsRegistry");
        match self.records.try_lock().as_deref() {
            Some(Some(records)) => debug.field("records", &records.len()),
            Some(None) => debug.field("initialized", &false),
            None => debug.field("records", &"<locked>"),
        };
        debug.finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
