//! Page-locked memory.
//!
//! [`PageLock`] pins a caller-owned range of memory with `mlock(2)` and
//! releases the pin exactly once, either explicitly through
//! [`PageLock::unlock`] or when dropped. [`Balloon`] allocates and pins its own
//! memory. Pins are reference counted per page, so locks over ranges sharing a
//! page don't release each other.
//!
//! Process-wide limits on lockable memory are enforced by the OS and surface as
//! [`PageLockError::Permission`]; [`status`] reads them.

pub mod balloon;
mod nonempty_range;
pub mod page_addr;
pub mod page_lock;
mod range_ext;
mod registry;
pub mod status;

pub use balloon::{Balloon, BalloonError};
pub use page_addr::{PageAddr, page_size};
pub use page_lock::{LockOptions, PageLock, PageLockError};
