use std::{ffi::c_void, num::NonZeroUsize, ops::Range, ptr::NonNull, sync::OnceLock};

use nix::unistd::{SysconfVar, sysconf};

/// Returns the platform page size in bytes.
///
/// The value is queried once via `sysconf(_SC_PAGESIZE)` and cached.
pub fn page_size() -> NonZeroUsize {
    static PAGE_SIZE: OnceLock<NonZeroUsize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = sysconf(SysconfVar::PAGE_SIZE)
            .expect("`sysconf(_SC_PAGESIZE)` should've succeeded")
            .expect("page size should've been defined");
        usize::try_from(size)
            .ok()
            .and_then(NonZeroUsize::new)
            .expect("page size should be a positive usize")
    })
}

fn page_mask() -> usize {
    !(page_size().get() - 1)
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageAddr(NonZeroUsize);

impl std::fmt::Debug for PageAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:01$x}", self.0, size_of_val(&self.0))
    }
}

impl std::fmt::Display for PageAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Delegate to Debug
        write!(f, "{:?}", self)
    }
}

impl From<PageAddr> for NonNull<c_void> {
    fn from(value: PageAddr) -> Self {
        NonNull::new(value.0.get() as *mut c_void).expect("non-0 usize is non-null ptr")
    }
}

impl PageAddr {
    pub fn get(self) -> usize {
        self.0.get()
    }

    /// Returns the page containing `value`, or `None` for the null page.
    pub fn containing_page(value: NonNull<c_void>) -> Option<PageAddr> {
        let addr = (value.as_ptr() as usize) & page_mask();
        Some(PageAddr(NonZeroUsize::new(addr)?))
    }

    /// Returns the smallest range of pages covering `length` bytes starting at `addr`.
    ///
    /// Returns `None` if the byte range starts in the null page or wraps around
    /// the address space.
    pub fn enclosing_range(addr: NonNull<c_void>, length: NonZeroUsize) -> Option<Range<PageAddr>> {
        let start = PageAddr::containing_page(addr)?;
        let end_addr = (addr.as_ptr() as usize).checked_add(length.get())?;
        let end_page_addr = end_addr.checked_add(page_size().get() - 1)? & page_mask();
        Some(start..PageAddr(NonZeroUsize::new(end_page_addr)?))
    }
}

pub trait RangeExtLen {
    fn len(&self) -> NonZeroUsize;
}

impl RangeExtLen for Range<PageAddr> {
    fn len(&self) -> NonZeroUsize {
        let length = self
            .end
            .0
            .get()
            .checked_sub(self.start.0.get())
            .expect("invariant: start page should be < than end page");
        NonZeroUsize::new(length).expect("invariant: start page should be < than end page")
    }
}

#[cfg(test)]
pub(crate) fn page_at(index: usize) -> PageAddr {
    PageAddr(NonZeroUsize::new(index * page_size().get()).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(addr: usize) -> NonNull<c_void> {
        NonNull::new(addr as *mut c_void).unwrap()
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().get().is_power_of_two());
    }

    #[test]
    fn test_from_page_addr_to_nonnull() {
        let ptr: NonNull<c_void> = page_at(42).into();
        assert_eq!(ptr.as_ptr() as usize, 42 * page_size().get());
    }

    #[test]
    fn test_containing_page() {
        let addr = PageAddr::containing_page(ptr(42 * page_size().get() + 1)).unwrap();
        assert_eq!(addr, page_at(42));

        assert!(PageAddr::containing_page(ptr(1)).is_none());
    }

    #[test]
    fn test_enclosing_range_unaligned_start() {
        // Two bytes straddling the boundary between page 42 and page 43.
        let start = ptr(43 * page_size().get() - 1);
        let range = PageAddr::enclosing_range(start, NonZeroUsize::new(2).unwrap()).unwrap();
        assert_eq!(range, page_at(42)..page_at(44));
    }

    #[test]
    fn test_enclosing_range_aligned() {
        let start = ptr(42 * page_size().get());
        let range = PageAddr::enclosing_range(start, page_size()).unwrap();
        assert_eq!(range, page_at(42)..page_at(43));
    }

    #[test]
    fn test_enclosing_range_overflow() {
        let start = ptr(usize::MAX - 1);
        assert!(PageAddr::enclosing_range(start, NonZeroUsize::new(16).unwrap()).is_none());
    }

    #[test]
    fn test_range_ext_len() {
        let range = page_at(42)..page_at(44);
        assert_eq!(range.len().get(), 2 * page_size().get());
    }
}
