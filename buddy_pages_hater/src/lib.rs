#![deny(unsafe_op_in_unsafe_fn)]

use buddy_pages::{
    AllocError, AllocInitError, BuddyAllocator, Global, PageMap, Pfn, PfnRange, ReserveError,
};
use page_hater::Subject;

pub struct BuddySubject<const ORDERS: usize>(BuddyAllocator<ORDERS, PfnRange, Global>);

impl<const ORDERS: usize> BuddySubject<ORDERS> {
    pub fn new(base: usize, num_pages: usize) -> Result<Self, AllocInitError> {
        if base.checked_add(num_pages).is_none() {
            return Err(AllocInitError::InvalidConfig);
        }

        let b = BuddyAllocator::try_new(PfnRange::new(Pfn::new(base), num_pages))?;
        Ok(BuddySubject(b))
    }

    pub fn inner(&self) -> &BuddyAllocator<ORDERS, PfnRange, Global> {
        &self.0
    }
}

impl<const ORDERS: usize> Subject for BuddySubject<ORDERS> {
    type AllocError = AllocError;
    type ReserveError = ReserveError;

    fn base(&self) -> usize {
        self.0.map().base().get()
    }

    fn num_pages(&self) -> usize {
        self.0.num_pages()
    }

    fn allocate(&mut self, order: usize) -> Result<usize, AllocError> {
        self.0.allocate(order).map(Pfn::get)
    }

    fn deallocate(&mut self, pfn: usize, order: usize) {
        self.0.deallocate(Pfn::new(pfn), order);
    }

    fn reserve(&mut self, pfn: usize) -> Result<(), ReserveError> {
        self.0.reserve(Pfn::new(pfn))
    }

    fn num_free_pages(&self) -> Option<usize> {
        Some(self.0.num_free_pages())
    }
}

#[cfg(test)]
mod tests {
    use page_hater::{AllocatorOp, Evaluator};

    use super::*;

    #[test]
    fn evaluate_mixed_ops() {
        let subject = BuddySubject::<5>::new(3, 45).unwrap();
        let mut eval = Evaluator::new(subject);

        let ops = [
            AllocatorOp::Alloc(0),
            AllocatorOp::Alloc(3),
            AllocatorOp::Reserve(20),
            AllocatorOp::Reserve(20),
            AllocatorOp::Alloc(4),
            AllocatorOp::Alloc(9),
            AllocatorOp::Dealloc(1),
            AllocatorOp::Reserve(45),
            AllocatorOp::Alloc(2),
            AllocatorOp::Dealloc(0),
        ];

        eval.evaluate(ops).unwrap();

        let subject = eval.into_subject();
        assert_eq!(subject.inner().num_free_pages(), 45);
    }

    #[test]
    fn rejects_overflowing_range() {
        assert!(BuddySubject::<5>::new(usize::MAX, 2).is_err());
    }
}
