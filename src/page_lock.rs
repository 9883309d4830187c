use std::{ffi::c_void, ops::Range, ptr::NonNull};

use log::{debug, warn};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    nonempty_range::{NonEmptyRange, NonEmptyRangeError},
    page_addr::{PageAddr, RangeExtLen},
    registry,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PageLockError {
    #[error("Invalid range: {msg}")]
    InvalidRange { msg: String },

    #[error("Permission denied ({errno}): {msg}")]
    Permission { msg: String, errno: Errno },

    #[error("Pages are not locked")]
    NotLocked,

    #[error("Generic runtime error ({errno}): {msg}")]
    RuntimeError { msg: String, errno: Errno },
}

impl From<NonEmptyRangeError> for PageLockError {
    fn from(value: NonEmptyRangeError) -> Self {
        PageLockError::InvalidRange { msg: value.to_string() }
    }
}

/// Options controlling how pages are locked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Lock pages only once they are faulted in (`MLOCK_ONFAULT`) instead of
    /// populating the whole range when locking.
    pub on_fault: bool,
}

/// Owned lock over a caller-owned range of memory.
///
/// The memory itself is not owned: the caller keeps it mapped for as long as
/// the handle is locked. Pages are unlocked either by [`PageLock::unlock`] or
/// when the handle is dropped, whichever comes first.
///
/// The OS locks whole pages, so the pinned range is the enclosing page range
/// of the requested bytes, see [`PageLock::pages`]. Pages shared by several
/// locks stay pinned until the last of them is unlocked.
#[derive(Debug)]
pub struct PageLock {
    range: NonEmptyRange<usize>,
    pages: Range<PageAddr>,
    options: LockOptions,
    locked: bool,
}

impl PageLock {
    /// Locks `length` bytes starting at `addr` with default options.
    ///
    /// # Returns
    ///
    /// Returns a locked handle if successful, otherwise returns an error.
    ///
    /// - `PageLockError::InvalidRange` if `length` is 0, the range is malformed,
    ///   or part of it is not mapped
    /// - `PageLockError::Permission` if the process lacks the privilege or the
    ///   `RLIMIT_MEMLOCK` budget to lock the range
    pub fn lock(addr: *const c_void, length: usize) -> Result<Self, PageLockError> {
        Self::lock_with(addr, length, &LockOptions::default())
    }

    /// Locks `length` bytes starting at `addr`.
    ///
    /// See [`PageLock::lock`] for the errors returned.
    pub fn lock_with(addr: *const c_void, length: usize, options: &LockOptions) -> Result<Self, PageLockError> {
        let range = NonEmptyRange::from_raw_parts(addr, length)?;
        let pages =
            PageAddr::enclosing_range(range.addr(), range.length()).ok_or_else(|| PageLockError::InvalidRange {
                msg: "range is not representable as pages".into(),
            })?;

        registry::process().acquire(&pages, options)?;
        debug!("locked {} bytes in pages {:?}", range.length(), pages);
        Ok(PageLock {
            range,
            pages,
            options: *options,
            locked: true,
        })
    }

    /// Locks the memory backing `slice`.
    ///
    /// The slice must outlive the returned handle's locked state.
    pub fn lock_slice(slice: &[u8]) -> Result<Self, PageLockError> {
        Self::lock(slice.as_ptr().cast(), slice.len())
    }

    /// Unlocks the pages.
    ///
    /// Unlocking is not idempotent: calling this on an already unlocked handle
    /// returns `PageLockError::NotLocked`. If the OS refuses to unlock, the
    /// handle stays locked.
    pub fn unlock(&mut self) -> Result<(), PageLockError> {
        if !self.locked {
            return Err(PageLockError::NotLocked);
        }
        registry::process().release(&self.pages, &self.options)?;
        self.locked = false;
        debug!("unlocked pages {:?}", self.pages);
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Start of the requested byte range.
    pub fn addr(&self) -> *const c_void {
        self.range.addr().as_ptr()
    }

    /// Length of the requested byte range.
    pub fn length(&self) -> usize {
        self.range.length().get()
    }

    /// Pages pinned by this handle.
    pub fn pages(&self) -> Range<PageAddr> {
        self.pages.clone()
    }
}

impl Drop for PageLock {
    fn drop(&mut self) {
        if self.locked {
            if let Err(err) = self.unlock() {
                warn!("failed unlocking pages {:?} on drop: {}", self.pages, err);
            }
        }
    }
}

/// Thin layer over the `mlock` family translating `errno`s into `PageLockError`.
pub(crate) mod sys {
    use nix::sys::mman::MsFlags;

    use super::*;

    pub(crate) fn mlock(pages: &Range<PageAddr>, options: &LockOptions) -> Result<(), PageLockError> {
        let addr: NonNull<c_void> = pages.start.into();
        let length = pages.len().get();
        let result = if options.on_fault {
            // `nix` has no `mlock2` wrapper.
            let ret = unsafe { nix::libc::mlock2(addr.as_ptr(), length, nix::libc::MLOCK_ONFAULT) };
            Errno::result(ret).map(drop)
        } else {
            unsafe { nix::sys::mman::mlock(addr, length) }
        };
        result.map_err(|errno| match errno {
            Errno::EINVAL => PageLockError::InvalidRange {
                msg: format!("mlock rejected pages {:?}", pages),
            },
            Errno::ENOMEM if !is_mapped(pages) => PageLockError::InvalidRange {
                msg: format!("pages {:?} are not fully mapped", pages),
            },
            Errno::ENOMEM => PageLockError::Permission {
                msg: format!("locking {} bytes would exceed RLIMIT_MEMLOCK", length),
                errno,
            },
            Errno::EPERM | Errno::EAGAIN => PageLockError::Permission {
                msg: format!("unable to lock {} bytes", length),
                errno,
            },
            errno => PageLockError::RuntimeError {
                msg: "mlock failed".into(),
                errno,
            },
        })
    }

    pub(crate) fn munlock(pages: &Range<PageAddr>) -> Result<(), PageLockError> {
        unsafe { nix::sys::mman::munlock(pages.start.into(), pages.len().get()) }.map_err(|errno| match errno {
            Errno::EINVAL | Errno::ENOMEM => PageLockError::InvalidRange {
                msg: format!("munlock rejected pages {:?}", pages),
            },
            Errno::EPERM => PageLockError::Permission {
                msg: "unable to unlock pages".into(),
                errno,
            },
            errno => PageLockError::RuntimeError {
                msg: "munlock failed".into(),
                errno,
            },
        })
    }

    /// Checks whether every page of `pages` is mapped without touching them.
    ///
    /// `msync` fails with `ENOMEM` if part of the range is not mapped.
    fn is_mapped(pages: &Range<PageAddr>) -> bool {
        let result = unsafe { nix::sys::mman::msync(pages.start.into(), pages.len().get(), MsFlags::MS_ASYNC) };
        !matches!(result, Err(Errno::ENOMEM))
    }
}
