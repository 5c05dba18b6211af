//! Buddy arithmetic.
//!
//! A block of order `k` is a run of `2^k` contiguous page frames whose first
//! page-frame number is a multiple of `2^k`. Every block of order `k` other
//! than the largest has exactly one buddy: the other half of the order
//! `k + 1` block containing it.
//!
//! Functions taking `ORDERS` treat orders `0..ORDERS` as valid; anything
//! at or above `ORDERS` fails closed.

use crate::page::Pfn;

/// The conventional number of orders, giving blocks of up to `2^16` pages.
pub const MAX_ORDER: usize = 17;

/// Returns the number of pages in a block of the given order.
///
/// # Panics
///
/// Panics if `2^order` does not fit in a `usize`.
#[inline]
pub const fn pages_per_block(order: usize) -> usize {
    assert!(order < usize::BITS as usize, "order overflows usize");

    1 << order
}

/// Returns `true` if `pfn` is a multiple of `2^order`, without range checks
/// on `order`.
#[inline]
pub(crate) const fn aligned_to(pfn: Pfn, order: usize) -> bool {
    order < usize::BITS as usize && pfn.get() & (pages_per_block(order) - 1) == 0
}

/// Returns `true` if `pfn` can start a block of the given order.
///
/// Returns `false` if `order` is not less than `ORDERS`.
#[inline]
pub const fn is_aligned<const ORDERS: usize>(pfn: Pfn, order: usize) -> bool {
    order < ORDERS && aligned_to(pfn, order)
}

/// Returns the first page of the buddy of the order-`order` block starting at
/// `pfn`.
///
/// If the block is the lower half of its parent, the buddy is the block
/// immediately after it; otherwise the buddy is the block immediately before
/// it.
///
/// Returns `None` if `order` is not less than `ORDERS` or if `pfn` is not
/// aligned to `order`.
#[inline]
pub fn buddy_of<const ORDERS: usize>(pfn: Pfn, order: usize) -> Option<Pfn> {
    if !is_aligned::<ORDERS>(pfn, order) {
        return None;
    }

    let size = pages_per_block(order);

    // Neither branch can overflow: a lower half is at most
    // `usize::MAX + 1 - 2 * size`, and an upper half is at least `size`.
    if aligned_to(pfn, order + 1) {
        pfn.checked_add(size)
    } else {
        pfn.checked_sub(size)
    }
}

/// Returns the first page of the order-`order` block that contains `pfn`.
#[inline]
pub(crate) const fn block_containing(pfn: Pfn, order: usize) -> Pfn {
    Pfn::new(pfn.get() & !(pages_per_block(order) - 1))
}

/// Returns the largest order less than `ORDERS` of a block which starts at
/// `pfn` and fits within `pages` pages.
///
/// Returns `None` if `pages` is zero.
pub(crate) fn largest_fit<const ORDERS: usize>(pfn: Pfn, pages: usize) -> Option<usize> {
    if pages == 0 {
        return None;
    }

    // Both bounds are strictly below `usize::BITS`.
    let by_alignment = pfn.get().trailing_zeros() as usize;
    let by_size = pages.ilog2() as usize;

    Some(by_alignment.min(by_size).min(ORDERS - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: usize = 5;

    fn pfn(raw: usize) -> Pfn {
        Pfn::new(raw)
    }

    #[test]
    fn pages_per_block_is_pow2() {
        assert_eq!(pages_per_block(0), 1);
        assert_eq!(pages_per_block(1), 2);
        assert_eq!(pages_per_block(4), 16);
        assert_eq!(pages_per_block(MAX_ORDER - 1), 65536);
    }

    #[test]
    fn alignment() {
        assert!(is_aligned::<ORDERS>(pfn(0), 4));
        assert!(is_aligned::<ORDERS>(pfn(8), 3));
        assert!(!is_aligned::<ORDERS>(pfn(8), 4));
        assert!(is_aligned::<ORDERS>(pfn(5), 0));
        assert!(!is_aligned::<ORDERS>(pfn(6), 2));

        // Orders at or above ORDERS fail closed, even for pfn 0.
        assert!(!is_aligned::<ORDERS>(pfn(0), ORDERS));
        assert!(!is_aligned::<ORDERS>(pfn(0), usize::MAX));
    }

    #[test]
    fn buddies_are_symmetric() {
        for order in 0..ORDERS {
            let size = pages_per_block(order);
            for raw in (0..256).step_by(size) {
                let block = pfn(raw);
                let buddy = buddy_of::<ORDERS>(block, order).unwrap();

                assert_eq!(buddy_of::<ORDERS>(buddy, order), Some(block));
                assert_eq!(buddy.get() ^ block.get(), size);
            }
        }
    }

    #[test]
    fn buddy_direction() {
        // Left halves find their buddy to the right and vice versa.
        assert_eq!(buddy_of::<ORDERS>(pfn(0), 0), Some(pfn(1)));
        assert_eq!(buddy_of::<ORDERS>(pfn(1), 0), Some(pfn(0)));
        assert_eq!(buddy_of::<ORDERS>(pfn(8), 2), Some(pfn(12)));
        assert_eq!(buddy_of::<ORDERS>(pfn(12), 2), Some(pfn(8)));
        assert_eq!(buddy_of::<ORDERS>(pfn(16), 4), Some(pfn(0)));
    }

    #[test]
    fn buddy_of_rejects_bad_input() {
        assert_eq!(buddy_of::<ORDERS>(pfn(2), 2), None);
        assert_eq!(buddy_of::<ORDERS>(pfn(0), ORDERS), None);
    }

    #[test]
    fn buddy_of_extremes() {
        assert_eq!(buddy_of::<ORDERS>(pfn(usize::MAX), 0), Some(pfn(usize::MAX - 1)));
        assert_eq!(buddy_of::<ORDERS>(pfn(usize::MAX - 1), 0), Some(pfn(usize::MAX)));

        let top = usize::MAX - 15;
        assert_eq!(buddy_of::<ORDERS>(pfn(top), 3), Some(pfn(top + 8)));
        assert_eq!(buddy_of::<ORDERS>(pfn(top + 8), 3), Some(pfn(top)));
        assert_eq!(buddy_of::<ORDERS>(pfn(1), 0), Some(pfn(0)));
    }

    #[test]
    fn containing_block() {
        assert_eq!(block_containing(pfn(5), 0), pfn(5));
        assert_eq!(block_containing(pfn(5), 1), pfn(4));
        assert_eq!(block_containing(pfn(5), 2), pfn(4));
        assert_eq!(block_containing(pfn(5), 3), pfn(0));
        assert_eq!(block_containing(pfn(23), 3), pfn(16));
    }

    #[test]
    fn largest_fit_respects_alignment_and_size() {
        assert_eq!(largest_fit::<ORDERS>(pfn(0), 0), None);
        assert_eq!(largest_fit::<ORDERS>(pfn(0), 1), Some(0));
        assert_eq!(largest_fit::<ORDERS>(pfn(0), 7), Some(2));
        assert_eq!(largest_fit::<ORDERS>(pfn(0), 1000), Some(ORDERS - 1));
        assert_eq!(largest_fit::<ORDERS>(pfn(12), 1000), Some(2));
        assert_eq!(largest_fit::<ORDERS>(pfn(3), 1000), Some(0));
    }
}
