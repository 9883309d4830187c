use std::{num::NonZeroUsize, slice};

use log::debug;
use nix::{
    errno::Errno,
    sys::mman::{MapFlags, ProtFlags},
};
use thiserror::Error;

use crate::page_lock::{PageLock, PageLockError};

#[derive(Debug, Error)]
pub enum BalloonError {
    #[error("Mapping balloon memory failed ({errno}): {msg}")]
    Map { msg: String, errno: Errno },

    #[error(transparent)]
    Lock(#[from] PageLockError),
}

/// Self-allocated region of locked memory.
///
/// Unlike [`PageLock`], a balloon owns its memory: an anonymous private mapping
/// of at least `size` bytes which stays locked for the balloon's lifetime.
/// The `used` flag is free for the caller to track whether the balloon is
/// claimed and has no effect on the memory.
#[derive(Debug)]
pub struct Balloon {
    // Declared before `mapping` so the pages are unlocked before they're unmapped.
    lock: PageLock,
    mapping: util::MmapGuard,
    size: NonZeroUsize,
    used: bool,
}

impl Balloon {
    /// Maps and locks `size` bytes of zeroed memory.
    ///
    /// # Returns
    ///
    /// Returns the balloon if successful, otherwise returns an error.
    /// `size` of 0 is rejected with `PageLockError::InvalidRange`.
    pub fn new(size: usize) -> Result<Self, BalloonError> {
        let size = NonZeroUsize::new(size).ok_or_else(|| PageLockError::InvalidRange {
            msg: "balloon size must be > 0".into(),
        })?;

        let mmapped = unsafe {
            nix::sys::mman::mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ.union(ProtFlags::PROT_WRITE),
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|errno| BalloonError::Map {
            msg: format!("mmap with len {} failed", size),
            errno,
        })?;
        let mapping = unsafe { util::MmapGuard::from_raw(mmapped, size) };

        // On failure `mapping` is dropped and unmapped.
        let lock = PageLock::lock(mapping.addr().as_ptr(), size.get())?;
        debug!("inflated balloon of {} bytes at {:?}", size, lock.pages());

        Ok(Balloon {
            lock,
            mapping,
            size,
            used: false,
        })
    }

    /// Size of the balloon in bytes, as requested.
    pub fn size(&self) -> usize {
        self.size.get()
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    pub fn set_used(&mut self, used: bool) {
        self.used = used;
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is readable, `size` bytes long and lives as long as `self`.
        unsafe { slice::from_raw_parts(self.mapping.addr().as_ptr().cast(), self.size.get()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is writable and uniquely borrowed through `self`.
        unsafe { slice::from_raw_parts_mut(self.mapping.addr().as_ptr().cast(), self.size.get()) }
    }
}

mod util {
    use std::{ffi::c_void, num::NonZeroUsize, ptr::NonNull};

    use log::warn;

    /// Guard for `nix::sys::mman::mmap`ped memory, unmapped on drop.
    #[derive(Debug)]
    pub(super) struct MmapGuard {
        addr: NonNull<c_void>,
        length: NonZeroUsize,
    }

    // The mapping is plain anonymous memory owned by the guard.
    unsafe impl Send for MmapGuard {}
    unsafe impl Sync for MmapGuard {}

    impl MmapGuard {
        pub unsafe fn from_raw(addr: NonNull<c_void>, length: NonZeroUsize) -> Self {
            Self { addr, length }
        }
        pub fn addr(&self) -> NonNull<c_void> {
            self.addr
        }
    }

    impl Drop for MmapGuard {
        fn drop(&mut self) {
            if let Err(errno) = unsafe { nix::sys::mman::munmap(self.addr, self.length.get()) } {
                warn!("munmap of {} bytes at {:?} failed: {}", self.length, self.addr, errno);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use crate::{
        page_addr::{RangeExtLen, page_size},
        status::locked_bytes,
    };

    use super::*;

    #[test]
    #[serial]
    fn test_balloon_new() {
        let size = 3 * page_size().get() + 7;
        let mut balloon = Balloon::new(size).unwrap();
        assert_eq!(balloon.size(), size);
        assert!(balloon.is_locked());
        assert!(!balloon.is_used());

        assert!(balloon.as_slice().iter().all(|byte| *byte == 0));
        balloon.as_mut_slice().fill(42);
        assert!(balloon.as_slice().iter().all(|byte| *byte == 42));
    }

    #[test]
    #[serial]
    fn test_balloon_used_flag() {
        let mut balloon = Balloon::new(1).unwrap();
        balloon.set_used(true);
        assert!(balloon.is_used());
        balloon.set_used(false);
        assert!(!balloon.is_used());
        assert!(balloon.is_locked());
    }

    #[test]
    fn test_balloon_zero_size() {
        let result = Balloon::new(0);
        assert!(matches!(result, Err(BalloonError::Lock(PageLockError::InvalidRange { .. }))));
    }

    #[test]
    #[serial]
    fn test_balloon_drop_unlocks() {
        let baseline = locked_bytes().unwrap();
        let balloon = Balloon::new(2 * page_size().get()).unwrap();
        assert_eq!(locked_bytes().unwrap(), baseline + balloon.lock.pages().len().get());
        drop(balloon);
        assert_eq!(locked_bytes().unwrap(), baseline);
    }
}
