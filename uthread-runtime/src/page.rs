//! # Protected Pages
//!
//! One anonymous, private, page-sized mapping per [`Page`], mapped with no
//! access. Contents are reachable only through short [`AccessWindow`]
//! brackets that grant exactly the permission an operation needs and
//! restore no-access when they close, including on unwind.
//!
//! ## Ownership
//!
//! Pages are shared between TPS records as `Arc<Page>`. The strong count is
//! the page's reference count; when the last owner lets go, `Drop` removes
//! the page from the live index and unmaps it, in that order.
//!
//! Protection is a property of the mapping, so it is seen by every thread at
//! once. Callers must serialize windows (the TPS registry does this through
//! the scheduler's critical section).

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, Ordering};

use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use thiserror::Error;
use tracing::{error, warn};

use crate::error::ErrorKind;
use crate::signal;

/// Size in bytes of one TPS page.
pub const TPS_SIZE: usize = 4096;

const PAGE_LEN: NonZeroUsize = match NonZeroUsize::new(TPS_SIZE) {
    Some(len) => len,
    None => panic!("TPS_SIZE must be non-zero"),
};

// ============================================================================
// Errors
// ============================================================================

/// Error raised by page operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageError {
    /// The kernel refused to create the mapping.
    #[error("failed to map page: {0}")]
    Map(#[source] nix::Error),
    /// The kernel refused to change the page protection.
    #[error("failed to change page protection to {protection}: {source}")]
    Protect {
        /// Protection that was requested.
        protection: Protection,
        /// Underlying OS error.
        #[source]
        source: nix::Error,
    },
    /// The byte range does not fit inside the page.
    #[error("range of {length} bytes at offset {offset} exceeds the {}-byte page", TPS_SIZE)]
    OutOfBounds {
        /// Start of the range.
        offset: usize,
        /// Length of the range.
        length: usize,
    },
}

impl PageError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PageError::Map(_) | PageError::Protect { .. } => ErrorKind::ResourceExhaustion,
            PageError::OutOfBounds { .. } => ErrorKind::Validation,
        }
    }
}

/// Check that `length` bytes at `offset` fit in a page, without overflow.
pub fn check_range(offset: usize, length: usize) -> Result<(), PageError> {
    match offset.checked_add(length) {
        Some(end) if end <= TPS_SIZE => Ok(()),
        _ => Err(PageError::OutOfBounds { offset, length }),
    }
}

// ============================================================================
// Protection
// ============================================================================

/// Access permitted on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Protection {
    /// Any access faults.
    #[default]
    None = 0,
    /// Loads permitted.
    Read = 1,
    /// Stores permitted.
    Write = 2,
    /// Loads and stores permitted.
    ReadWrite = 3,
}

impl Protection {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Protection::Read,
            2 => Protection::Write,
            3 => Protection::ReadWrite,
            _ => Protection::None,
        }
    }

    fn flags(self) -> ProtFlags {
        match self {
            Protection::None => ProtFlags::PROT_NONE,
            Protection::Read => ProtFlags::PROT_READ,
            Protection::Write => ProtFlags::PROT_WRITE,
            Protection::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }

    /// Get the protection name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protection::None => "none",
            Protection::Read => "read",
            Protection::Write => "write",
            Protection::ReadWrite => "read-write",
        }
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Page
// ============================================================================

/// A single protected page of thread-private storage.
pub struct Page {
    /// Base of the mapping.
    addr: NonNull<c_void>,
    /// Protection currently applied, as a `Protection` discriminant.
    protection: AtomicU8,
}

// Safety: the mapping is plain memory owned by this value; all access goes
// through windows that callers serialize.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Map a fresh zero-filled page with no access.
    pub fn map() -> Result<Self, PageError> {
        // SAFETY: anonymous private mapping, no fd, no fixed address.
        let addr = unsafe {
            mmap_anonymous(None, PAGE_LEN, ProtFlags::PROT_NONE, MapFlags::MAP_PRIVATE)
        }
        .map_err(PageError::Map)?;

        signal::track_page(addr.as_ptr() as usize);

        Ok(Self {
            addr,
            protection: AtomicU8::new(Protection::None as u8),
        })
    }

    /// Base address of the mapping.
    pub fn address(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    /// Protection currently applied to the page.
    pub fn protection(&self) -> Protection {
        Protection::from_u8(self.protection.load(Ordering::Acquire))
    }

    fn set_protection(&self, protection: Protection) -> Result<(), PageError> {
        // SAFETY: `addr` is the base of a live mapping of TPS_SIZE bytes.
        unsafe { mprotect(self.addr, TPS_SIZE, protection.flags()) }
            .map_err(|source| PageError::Protect { protection, source })?;
        self.protection.store(protection as u8, Ordering::Release);
        Ok(())
    }

    /// Open an access window granting `protection` until it is dropped.
    pub fn open(&self, protection: Protection) -> Result<AccessWindow<'_>, PageError> {
        self.set_protection(protection)?;
        Ok(AccessWindow { page: self })
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the page.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<(), PageError> {
        check_range(offset, dst.len())?;
        let window = self.open(Protection::Read)?;
        // SAFETY: the range is inside the mapping and the window grants read.
        unsafe {
            ptr::copy_nonoverlapping(window.base().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the page starting at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<(), PageError> {
        check_range(offset, src.len())?;
        let window = self.open(Protection::Write)?;
        // SAFETY: the range is inside the mapping and the window grants write.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), window.base().add(offset), src.len());
        }
        Ok(())
    }

    /// Map a new page holding a copy of this one.
    ///
    /// The new page is opened for write before this one is opened for read,
    /// and closed first, so neither is ever accessible longer than the copy.
    pub fn duplicate(&self) -> Result<Page, PageError> {
        let copy = Page::map()?;
        let dst = copy.open(Protection::Write)?;
        let src = self.open(Protection::Read)?;
        // SAFETY: both mappings are TPS_SIZE bytes, distinct, and the windows
        // grant the needed access.
        unsafe {
            ptr::copy_nonoverlapping(src.base(), dst.base(), TPS_SIZE);
        }
        drop(dst);
        drop(src);
        Ok(copy)
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        signal::untrack_page(self.address());
        // SAFETY: the mapping is owned by this page and no window can outlive it.
        if let Err(err) = unsafe { munmap(self.addr, TPS_SIZE) } {
            error!(address = self.address(), %err, "failed to unmap TPS page");
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("protection", &self.protection())
            .finish()
    }
}

/// A bracket during which a page is accessible.
///
/// Dropping the window returns the page to no-access.
pub struct AccessWindow<'a> {
    page: &'a Page,
}

impl<'a> AccessWindow<'a> {
    /// Base pointer of the page. Valid for the permission the window granted.
    pub fn base(&self) -> *mut u8 {
        self.page.addr.as_ptr().cast()
    }

    /// The page this window belongs to.
    pub fn page(&self) -> &'a Page {
        self.page
    }
}

impl Drop for AccessWindow<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.page.set_protection(Protection::None) {
            warn!(address = self.page.address(), %err, "failed to restore page protection");
        }
    }
}
