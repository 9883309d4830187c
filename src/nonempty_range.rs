use std::{
    ffi::c_void,
    num::NonZeroUsize,
    ops::Range,
    ptr::NonNull,
};

use thiserror::Error;

/// Byte range `[start, end)` that is known to be non-empty and to not wrap
/// around the address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyRange<T>(Range<T>);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NonEmptyRangeError {
    #[error("Empty range")]
    EmptyRange,

    #[error("Null address")]
    NullAddress,

    #[error("Range wraps around the address space")]
    Overflow,
}

impl<T: PartialOrd> TryFrom<Range<T>> for NonEmptyRange<T> {
    type Error = NonEmptyRangeError;

    fn try_from(value: Range<T>) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(NonEmptyRangeError::EmptyRange);
        }
        Ok(Self(value))
    }
}

impl NonEmptyRange<usize> {
    /// Builds the byte range of `length` bytes starting at `addr`.
    pub fn from_raw_parts(addr: *const c_void, length: usize) -> Result<Self, NonEmptyRangeError> {
        if length == 0 {
            return Err(NonEmptyRangeError::EmptyRange);
        }
        let start = addr as usize;
        if start == 0 {
            return Err(NonEmptyRangeError::NullAddress);
        }
        let end = start.checked_add(length).ok_or(NonEmptyRangeError::Overflow)?;
        (start..end).try_into()
    }

    pub fn addr(&self) -> NonNull<c_void> {
        NonNull::new(self.0.start as *mut c_void).expect("invariant: start address is non-null")
    }

    pub fn length(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.0.end - self.0.start).expect("invariant: range is non-empty")
    }
}
