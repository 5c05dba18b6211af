#![no_main]

use arbitrary::Arbitrary;
use buddy_pages::{BuddyAllocator, Global, Pfn, PfnRange};
use libfuzzer_sys::fuzz_target;

const ORDERS: usize = 8;
const MAX_PAGES: usize = 4096;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    base: u16,
    num_pages: u16,
    reserved: Vec<u16>,
}

fuzz_target!(|args: Args| {
    let num_pages = usize::from(args.num_pages) % MAX_PAGES;
    let base = Pfn::new(args.base.into());

    let mut buddy: BuddyAllocator<ORDERS, _, Global> =
        match BuddyAllocator::try_new(PfnRange::new(base, num_pages)) {
            Ok(b) => b,
            Err(_) => return,
        };

    let mut owned = vec![false; num_pages];
    let mut pages = Vec::new();

    for raw in args.reserved {
        let idx = usize::from(raw) % (num_pages + 1);
        let page = Pfn::new(base.get() + idx);

        let expected = owned.get(idx).is_some_and(|&o| !o);
        assert_eq!(buddy.reserve(page).is_ok(), expected, "reserve {page:?}");

        if expected {
            owned[idx] = true;
            pages.push(page);
            assert!(!buddy.is_free(page));
        }

        assert_eq!(buddy.num_free_pages(), num_pages - pages.len());
    }

    for page in pages {
        buddy.deallocate(page, 0);
    }

    // With every reservation undone, the initial decomposition is restored.
    let fresh: BuddyAllocator<ORDERS, _, Global> =
        BuddyAllocator::try_new(PfnRange::new(base, num_pages)).unwrap();
    for order in 0..ORDERS {
        assert!(buddy.free_blocks(order).eq(fresh.free_blocks(order)));
    }
});
