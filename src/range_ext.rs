use std::{
    cmp::{max, min},
    ops::Range,
};

use crate::page_addr::PageAddr;

pub trait RangeExtOps {
    fn intersection(&self, other: &Self) -> Self;
}
impl RangeExtOps for Range<PageAddr> {
    fn intersection(&self, other: &Self) -> Self {
        let start = max(self.start, other.start);
        let end = min(self.end, other.end);
        if end <= start {
            // Return empty range starting from `self.start`
            self.start..self.start
        } else {
            start..end
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::page_addr::{RangeExtLen, page_at, page_size};

    use super::*;

    #[test]
    fn test_range_ext_ops_nonempty_intersection() {
        let range = page_at(10)..page_at(25);
        let intersecting_range = page_at(20)..page_at(45);

        let intersection = range.intersection(&intersecting_range);
        assert_eq!(intersection.len().get(), 5 * page_size().get());
        assert_eq!(intersection.start, page_at(20));
        assert_eq!(intersection.end, page_at(25));
    }

    #[test]
    fn test_range_ext_ops_empty_intersection() {
        let range = page_at(10)..page_at(25);
        let disjoint_range = page_at(30)..page_at(65);

        let intersection = range.intersection(&disjoint_range);
        assert!(intersection.is_empty());
        assert_eq!(intersection.start, range.start);
        assert_eq!(intersection.end, range.start);
    }
}
