//! A small library for ~~hating on~~ evaluating the correctness of page allocators.
//!
//! Page allocators hand out page-frame numbers rather than memory, so instead
//! of painting the allocated bytes, the evaluator keeps a shadow table with
//! the owner of every managed page and checks each result against it.

/// The largest order requested by an arbitrary operation.
pub const ORDER_LIMIT: u8 = 20;

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
    Reserve,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate a block of `2^order` pages.
    Alloc(usize),
    /// Free the outstanding block at this index, modulo the number of
    /// outstanding blocks.
    Dealloc(usize),
    /// Reserve the page at this offset from the base, modulo one more than
    /// the number of managed pages.
    Reserve(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc((u8::arbitrary(u)? % ORDER_LIMIT).into()),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
            AllocatorOpTag::Reserve => AllocatorOp::Reserve(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;
    type ReserveError;

    /// Returns the page-frame number of the first managed page.
    fn base(&self) -> usize;

    /// Returns the number of managed pages.
    fn num_pages(&self) -> usize;

    /// Allocates a block of `2^order` pages and returns its first page-frame
    /// number.
    fn allocate(&mut self, order: usize) -> Result<usize, Self::AllocError>;

    /// Frees the block of `2^order` pages starting at `pfn`.
    ///
    /// The block must be currently allocated with this order.
    fn deallocate(&mut self, pfn: usize, order: usize);

    /// Removes the single page `pfn` from the free pool.
    fn reserve(&mut self, pfn: usize) -> Result<(), Self::ReserveError>;

    /// Returns the number of free pages, if the subject can report it.
    fn num_free_pages(&self) -> Option<usize> {
        None
    }
}

/// An allocated block of pages.
#[derive(Clone, Debug)]
pub struct Block {
    pfn: usize,
    order: usize,
    // The unique ID of the operation that allocated this block.
    id: u64,
}

impl Block {
    pub fn pfn(&self) -> usize {
        self.pfn
    }

    pub fn order(&self) -> usize {
        self.order
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// The owner of every managed page.
pub struct Frames {
    base: usize,
    owners: Vec<Option<u64>>,
}

impl Frames {
    pub fn new(base: usize, num_pages: usize) -> Frames {
        Frames {
            base,
            owners: vec![None; num_pages],
        }
    }

    fn range(&self, pfn: usize, order: usize) -> Option<std::ops::Range<usize>> {
        let start = pfn.checked_sub(self.base)?;
        let end = start.checked_add(1_usize.checked_shl(order.try_into().ok()?)?)?;

        (end <= self.owners.len()).then_some(start..end)
    }

    /// Marks the block as owned by `id`.
    ///
    /// Returns `false` if the block is misaligned, lies outside the managed
    /// range, or overlaps an owned page.
    pub fn claim(&mut self, pfn: usize, order: usize, id: u64) -> bool {
        if order >= usize::BITS as usize || pfn.trailing_zeros() < order as u32 {
            return false;
        }

        match self.range(pfn, order) {
            Some(range) if self.owners[range.clone()].iter().all(Option::is_none) => {
                self.owners[range].fill(Some(id));
                true
            }

            _ => false,
        }
    }

    /// Verifies that `block` still owns all of its pages, and releases them.
    pub fn release(&mut self, block: &Block) -> bool {
        match self.range(block.pfn, block.order) {
            Some(range) if self.owners[range.clone()].iter().all(|&o| o == Some(block.id)) => {
                self.owners[range].fill(None);
                true
            }

            _ => false,
        }
    }

    /// Returns `true` if `pfn` is managed and not owned.
    pub fn is_free(&self, pfn: usize) -> bool {
        self.range(pfn, 0)
            .is_some_and(|range| self.owners[range.start].is_none())
    }

    pub fn num_free(&self) -> usize {
        self.owners.iter().filter(|o| o.is_none()).count()
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: AllocatorOp,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let num_pages = self.subject.num_pages();
        let mut frames = Frames::new(self.subject.base(), num_pages);
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();

            let ok = match op {
                AllocatorOp::Alloc(order) => match self.subject.allocate(order) {
                    Ok(pfn) => {
                        blocks.push(Block {
                            pfn,
                            order,
                            id: op_id,
                        });
                        frames.claim(pfn, order, op_id)
                    }

                    Err(_) => true,
                },

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    Some(block) => {
                        let ok = frames.release(&block);
                        if ok {
                            self.subject.deallocate(block.pfn, block.order);
                        }
                        ok
                    }

                    None => true,
                },

                AllocatorOp::Reserve(offset) => {
                    let pfn = self.subject.base() + offset % (num_pages + 1);
                    let was_free = frames.is_free(pfn);

                    match self.subject.reserve(pfn) {
                        Ok(()) => {
                            blocks.push(Block {
                                pfn,
                                order: 0,
                                id: op_id,
                            });
                            was_free && frames.claim(pfn, 0, op_id)
                        }

                        Err(_) => !was_free,
                    }
                }
            };

            let consistent = self
                .subject
                .num_free_pages()
                .is_none_or(|free| free == frames.num_free());

            if !ok || !consistent {
                return Err(Failed {
                    completed,
                    failed_op: op,
                });
            }

            completed.push(op);
        }

        for block in blocks {
            if frames.release(&block) {
                self.subject.deallocate(block.pfn, block.order);
            }
        }

        Ok(())
    }
}
