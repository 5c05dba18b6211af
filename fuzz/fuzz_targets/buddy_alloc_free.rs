#![no_main]

use arbitrary::Arbitrary;
use buddy_pages::MAX_ORDER;
use buddy_pages_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;
use page_hater::{AllocatorOp, Evaluator};

const MAX_PAGES: usize = 1 << 16;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    base: u32,
    num_pages: usize,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let num_pages = args.num_pages % MAX_PAGES;
    let subject = match BuddySubject::<MAX_ORDER>::new(args.base as usize, num_pages) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    if let Err(failed) = eval.evaluate(args.ops) {
        panic!("{failed:#?}");
    }

    let subject = eval.into_subject();
    assert_eq!(subject.inner().num_free_pages(), num_pages);
});
