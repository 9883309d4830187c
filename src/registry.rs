//! Reference counted page locking.
//!
//! `mlock` does not nest: unlocking a page releases it regardless of how many
//! times it was locked. Two locks over ranges sharing a page would therefore
//! release each other's pin. Every lock in the process goes through one
//! [`LockRegistry`], which counts locks per page and only calls into the OS
//! when a page's count goes from 0 to 1 or from 1 to 0.

use std::{
    num::NonZeroUsize,
    ops::Range,
    sync::{Mutex, MutexGuard, OnceLock, PoisonError},
};

use log::{debug, warn};
use rangemap::RangeMap;

use crate::{
    page_addr::PageAddr,
    page_lock::{LockOptions, PageLockError, sys},
    range_ext::RangeExtOps,
};

#[derive(Debug, Default)]
pub(crate) struct LockRegistry {
    pages: Mutex<RangeMap<PageAddr, NonZeroUsize>>,
}

/// Returns the registry shared by every lock of the process.
pub(crate) fn process() -> &'static LockRegistry {
    static REGISTRY: OnceLock<LockRegistry> = OnceLock::new();
    REGISTRY.get_or_init(LockRegistry::default)
}

impl LockRegistry {
    /// Takes a hold on `pages`, locking the ones no other lock holds yet.
    ///
    /// Pages already held keep the options they were first locked with.
    /// On error no page changes state.
    pub(crate) fn acquire(&self, pages: &Range<PageAddr>, options: &LockOptions) -> Result<(), PageLockError> {
        let mut counts = self.counts();
        let unlocked: Vec<Range<PageAddr>> = counts.gaps(pages).collect();
        for (idx, gap) in unlocked.iter().enumerate() {
            if let Err(err) = sys::mlock(gap, options) {
                for locked in &unlocked[..idx] {
                    if let Err(err) = sys::munlock(locked) {
                        warn!("failed rolling back lock of pages {:?}: {}", locked, err);
                    }
                }
                return Err(err);
            }
        }
        update_counts(&mut counts, pages, |count| NonZeroUsize::new(count + 1));
        debug!("acquired pages {:?}, newly locked {:?}", pages, unlocked);
        Ok(())
    }

    /// Drops a hold on `pages`, unlocking the ones no other lock holds.
    ///
    /// On error no page changes state.
    pub(crate) fn release(&self, pages: &Range<PageAddr>, options: &LockOptions) -> Result<(), PageLockError> {
        let mut counts = self.counts();
        let released: Vec<Range<PageAddr>> = counts
            .overlapping(pages)
            .filter(|(_, count)| count.get() == 1)
            .map(|(range, _)| range.intersection(pages))
            .collect();
        for (idx, range) in released.iter().enumerate() {
            if let Err(err) = sys::munlock(range) {
                for unlocked in &released[..idx] {
                    if let Err(err) = sys::mlock(unlocked, options) {
                        warn!("failed rolling back unlock of pages {:?}: {}", unlocked, err);
                    }
                }
                return Err(err);
            }
        }
        update_counts(&mut counts, pages, |count| count.checked_sub(1).and_then(NonZeroUsize::new));
        debug!("released pages {:?}, unlocked {:?}", pages, released);
        Ok(())
    }

    /// Returns whether `page` is held by at least one lock.
    pub(crate) fn is_page_locked(&self, page: PageAddr) -> bool {
        self.counts().contains_key(&page)
    }

    fn counts(&self) -> MutexGuard<'_, RangeMap<PageAddr, NonZeroUsize>> {
        // Counts are only updated after every OS call succeeded.
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Applies `update` to the count of every page in `pages`, treating pages
/// missing from `counts` as 0. A `None` result removes the pages.
fn update_counts(
    counts: &mut RangeMap<PageAddr, NonZeroUsize>,
    pages: &Range<PageAddr>,
    update: impl Fn(usize) -> Option<NonZeroUsize>,
) {
    let mut updated: Vec<(Range<PageAddr>, Option<NonZeroUsize>)> = counts
        .overlapping(pages)
        .map(|(range, count)| (range.intersection(pages), update(count.get())))
        .collect();
    updated.extend(counts.gaps(pages).map(|gap| (gap, update(0))));
    for (range, count) in updated {
        match count {
            Some(count) => counts.insert(range, count),
            None => counts.remove(range),
        }
    }
}
