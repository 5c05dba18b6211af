//! Binary-buddy page-frame allocation.
//!
//! A buddy allocator manages a range of page frames as blocks of `2^order`
//! pages, for orders `0..ORDERS`. Every block starts at a page-frame number
//! that is a multiple of its size. Allocating a block of order `k` takes the
//! lowest-addressed free block of the smallest order at or above `k` and
//! splits it in half until a block of order `k` remains; freeing a block
//! merges it with its buddy for as long as the buddy is also free.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! Free lists are kept sorted by address, so list operations are linear in
//! the length of the list they touch, `L`.
//!
//! | Operation                | Best-case | Worst-case     |
//! |--------------------------|-----------|----------------|
//! | Allocate                 | O(1)      | O(ORDERS * L)  |
//! | Deallocate               | O(L)      | O(ORDERS * L)  |
//! | Reserve                  | O(ORDERS) | O(ORDERS * L)  |
//!
//! #### Fragmentation
//!
//! Buddy allocators exhibit limited external fragmentation, but suffer up to
//! 50% internal fragmentation because all allocatable blocks are a power of
//! two pages in size.

use core::{alloc::Layout, cmp, fmt, mem, ptr::NonNull, slice};

#[cfg(feature = "unstable")]
use core::alloc::Allocator;

#[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
use crate::Global;

#[cfg(all(any(feature = "alloc", test), feature = "unstable"))]
use alloc::alloc::Global;

use crate::{
    free_area::{self, FreeArea, FreeLink, LinkTable, Links, Slot},
    order::{self, pages_per_block, MAX_ORDER},
    page::{PageMap, Pfn},
    AllocError, AllocInitError, BackingAllocator, Raw, ReserveError,
};

/// A `BuddyAllocator` with [`MAX_ORDER`] orders.
pub type DefaultBuddyAllocator<M, A> = BuddyAllocator<MAX_ORDER, M, A>;

/// A binary-buddy page-frame allocator.
///
/// This takes three type parameters:
/// - `ORDERS` is the number of block orders. The largest block the allocator
///   hands out has `2^(ORDERS - 1)` pages.
/// - `M` translates between page handles and page-frame numbers, and
///   determines the range of pages managed by the allocator.
/// - `A` provides the memory for the free-list metadata. See
///   [`BackingAllocator`].
///
/// `ORDERS` must be nonzero and less than `usize::BITS`; constructors return
/// [`AllocInitError::InvalidConfig`] otherwise.
///
/// For example, the type of an allocator over a descriptor table, handing out
/// blocks of 1 to 1024 pages, would be:
///
/// ```
/// use buddy_pages::{BuddyAllocator, PageDescriptors, Raw};
///
/// struct Page {
///     flags: u64,
/// }
///
/// type PageAllocator<'a> = BuddyAllocator<11, PageDescriptors<'a, Page>, Raw>;
/// # fn main() {}
/// ```
pub struct BuddyAllocator<const ORDERS: usize, M: PageMap, A: BackingAllocator> {
    /// Pointer to the free-list links, one per managed page.
    metadata: NonNull<FreeLink>,
    map: M,
    areas: [FreeArea; ORDERS],
    backing_allocator: A,
}

// SAFETY: The link table is owned exclusively by the allocator and is only
// accessed through `&self` or `&mut self`.
unsafe impl<const ORDERS: usize, M, A> Send for BuddyAllocator<ORDERS, M, A>
where
    M: PageMap + Send,
    A: BackingAllocator + Send,
{
}

impl<const ORDERS: usize, M: PageMap> BuddyAllocator<ORDERS, M, Raw> {
    /// Constructs a new `BuddyAllocator` from a raw pointer to its metadata
    /// region, and initializes it so that every page in `map` is free.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `map` contains no pages
    /// or `ORDERS` is out of range.
    ///
    /// # Safety
    ///
    /// `metadata` must be a pointer to a region that satisfies the [`Layout`]
    /// returned by [`Self::metadata_layout(map.num_pages())`], and it must be
    /// valid for reads and writes for the entire size indicated by that
    /// `Layout` for as long as the allocator exists.
    ///
    /// [`Self::metadata_layout(map.num_pages())`]: Self::metadata_layout
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        map: M,
    ) -> Result<BuddyAllocator<ORDERS, M, Raw>, AllocInitError> {
        Self::check_config(&map)?;

        let mut buddy = unsafe { BuddyAllocatorParts::<ORDERS, M>::new(metadata, map) }
            .with_backing_allocator(Raw);
        buddy.init()?;

        Ok(buddy)
    }

    /// Decomposes the allocator into its raw components.
    ///
    /// The returned tuple contains the metadata pointer and the page map. The
    /// allocator's state is lost; the metadata region may be reused.
    pub fn into_raw_parts(self) -> (NonNull<u8>, M) {
        let this = mem::ManuallyDrop::new(self);

        // SAFETY: `this` is never used or dropped again, so `map` is moved out
        // exactly once.
        let map = unsafe { core::ptr::read(&this.map) };

        (this.metadata.cast(), map)
    }
}

#[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
impl<const ORDERS: usize, M: PageMap> BuddyAllocator<ORDERS, M, Global> {
    /// Attempts to construct a new `BuddyAllocator` whose metadata is
    /// allocated from the global allocator.
    ///
    /// Every page in `map` is free when this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if `map` contains no pages, if `ORDERS` is out of
    /// range, or if the metadata could not be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(map: M) -> Result<BuddyAllocator<ORDERS, M, Global>, AllocInitError> {
        Self::check_config(&map)?;

        let metadata_layout =
            Self::metadata_layout(map.num_pages()).map_err(|_| AllocInitError::InvalidConfig)?;

        unsafe {
            // SAFETY: metadata size is not zero, because the map is not empty.
            let metadata_raw = alloc::alloc::alloc(metadata_layout);
            let metadata = NonNull::new(metadata_raw)
                .ok_or(AllocInitError::AllocFailed(metadata_layout))?;

            let mut buddy = BuddyAllocatorParts::<ORDERS, M>::new(metadata, map)
                .with_backing_allocator(Global);
            buddy.init()?;

            Ok(buddy)
        }
    }
}

#[cfg(all(any(feature = "alloc", test), feature = "unstable"))]
impl<const ORDERS: usize, M: PageMap> BuddyAllocator<ORDERS, M, Global> {
    /// Attempts to construct a new `BuddyAllocator` whose metadata is
    /// allocated from the global allocator.
    ///
    /// Every page in `map` is free when this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if `map` contains no pages, if `ORDERS` is out of
    /// range, or if the metadata could not be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(map: M) -> Result<BuddyAllocator<ORDERS, M, Global>, AllocInitError> {
        Self::try_new_in(map, Global)
    }
}

#[cfg(feature = "unstable")]
impl<const ORDERS: usize, M: PageMap, A: Allocator> BuddyAllocator<ORDERS, M, A> {
    /// Attempts to construct a new `BuddyAllocator` whose metadata is
    /// allocated from `allocator`.
    ///
    /// Every page in `map` is free when this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if `map` contains no pages, if `ORDERS` is out of
    /// range, or if the metadata could not be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "unstable")))]
    pub fn try_new_in(
        map: M,
        allocator: A,
    ) -> Result<BuddyAllocator<ORDERS, M, A>, AllocInitError> {
        Self::check_config(&map)?;

        let metadata_layout =
            Self::metadata_layout(map.num_pages()).map_err(|_| AllocInitError::InvalidConfig)?;

        let metadata = allocator
            .allocate(metadata_layout)
            .map_err(|_| AllocInitError::AllocFailed(metadata_layout))?;

        unsafe {
            // SAFETY: metadata was received as NonNull via Allocator::allocate
            let metadata = NonNull::new_unchecked(metadata.as_ptr() as *mut u8);

            let mut buddy = BuddyAllocatorParts::<ORDERS, M>::new(metadata, map)
                .with_backing_allocator(allocator);
            buddy.init()?;

            Ok(buddy)
        }
    }
}

impl<const ORDERS: usize, M: PageMap, A: BackingAllocator> Drop for BuddyAllocator<ORDERS, M, A> {
    fn drop(&mut self) {
        // The layout was valid when the metadata was allocated.
        if let Ok(layout) = Self::metadata_layout(self.map.num_pages()) {
            unsafe {
                self.backing_allocator
                    .deallocate(self.metadata.cast(), layout)
            };
        }
    }
}

impl<const ORDERS: usize, M: PageMap, A: BackingAllocator> BuddyAllocator<ORDERS, M, A> {
    fn check_config(map: &M) -> Result<(), AllocInitError> {
        if ORDERS == 0 || ORDERS >= usize::BITS as usize || map.num_pages() == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        Ok(())
    }

    /// Returns the layout requirements of the metadata region for an
    /// allocator managing `num_pages` pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the size of the region would overflow an `isize`.
    pub fn metadata_layout(num_pages: usize) -> Result<Layout, core::alloc::LayoutError> {
        Layout::array::<FreeLink>(num_pages)
    }

    /// Returns the name of the allocation algorithm.
    pub fn name(&self) -> &'static str {
        "buddy"
    }

    /// Returns the page map.
    pub fn map(&self) -> &M {
        &self.map
    }

    /// Returns the number of pages managed by the allocator.
    pub fn num_pages(&self) -> usize {
        self.map.num_pages()
    }

    fn links(&self) -> Links<'_> {
        // SAFETY: `metadata` holds one initialized link per page and is only
        // mutated through `&mut self`.
        let links = unsafe { slice::from_raw_parts(self.metadata.as_ptr(), self.map.num_pages()) };

        Links::new(self.map.base(), links)
    }

    fn ladder(&mut self) -> Ladder<'_, ORDERS> {
        // SAFETY: `metadata` holds one initialized link per page, and the
        // returned borrow of `self` keeps it exclusive.
        let links =
            unsafe { slice::from_raw_parts_mut(self.metadata.as_ptr(), self.map.num_pages()) };

        Ladder {
            areas: &mut self.areas,
            links: LinkTable::new(self.map.base(), links),
        }
    }

    /// Returns `true` if the order-`order` block at `block` lies entirely
    /// within the managed range.
    fn contains_block(&self, block: Pfn, order: usize) -> bool {
        let end = block.pages_since(self.map.base()).and_then(|idx| {
            idx.checked_add(pages_per_block(order))
        });

        end.is_some_and(|end| end <= self.map.num_pages())
    }

    /// Finds the free block containing `target` whose order is at least
    /// `min_order`.
    fn find_free_block(&self, target: Pfn, min_order: usize) -> Option<(Pfn, usize)> {
        let links = self.links();

        (min_order..ORDERS).find_map(|order| {
            let candidate = order::block_containing(target, order);

            self.areas[order]
                .contains(links, candidate)
                .then_some((candidate, order))
        })
    }

    /// Returns a free block overlapping the order-`order` block at `block`,
    /// if any.
    fn free_block_overlapping(&self, block: Pfn, order: usize) -> Option<(Pfn, usize)> {
        let links = self.links();
        let size = pages_per_block(order);

        self.areas
            .iter()
            .enumerate()
            .find_map(|(area_order, area)| {
                if area_order >= order {
                    let candidate = order::block_containing(block, area_order);
                    area.contains(links, candidate).then_some((candidate, area_order))
                } else {
                    area.iter(links)
                        .find(|free| {
                            free.pages_since(block).is_some_and(|ofs| ofs < size)
                        })
                        .map(|free| (free, area_order))
                }
            })
    }

    /// Resets the allocator so that every managed page is free.
    ///
    /// The managed range is covered from its lowest page upward with the
    /// largest blocks that are properly aligned and fit in the remaining
    /// pages. If the range starts at a multiple of `2^(ORDERS - 1)` and its
    /// length is a multiple of that, every free block has the maximum order.
    ///
    /// Any outstanding blocks are forgotten.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the page map contains no
    /// pages.
    pub fn init(&mut self) -> Result<(), AllocInitError> {
        let num_pages = self.map.num_pages();
        if num_pages == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let base = self.map.base();
        let mut ladder = self.ladder();
        ladder.clear();

        // The last block appended to each order, to build the lists in
        // ascending order without searching them.
        let mut tails: [Option<Pfn>; ORDERS] = [None; ORDERS];

        let mut block = base;
        let mut remaining = num_pages;
        let mut num_blocks = 0;

        while let Some(order) = order::largest_fit::<ORDERS>(block, remaining) {
            ladder.areas[order].append(&mut ladder.links, tails[order], block);
            tails[order] = Some(block);
            num_blocks += 1;

            let size = pages_per_block(order);
            remaining -= size;

            // Cannot overflow: the end of the page map's range fits in a usize.
            block = Pfn::new(block.get() + size);
        }

        log::debug!(
            "{}: {} pages from {} in {} free blocks",
            self.name(),
            num_pages,
            base,
            num_blocks
        );

        Ok(())
    }

    /// Attempts to allocate a block of `2^order` contiguous pages.
    ///
    /// On success, returns the handle of the first page of the block. Its
    /// page-frame number is a multiple of `2^order`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `order` is not less than `ORDERS`, or if no free
    /// block of at least that order exists. The allocator is unchanged in
    /// either case.
    pub fn allocate(&mut self, order: usize) -> Result<M::Page, AllocError> {
        if order >= ORDERS {
            return Err(AllocError);
        }

        let mut ladder = self.ladder();

        // Scan increasing block sizes until a free block is found.
        let (mut block, found) = (order..ORDERS)
            .find_map(|o| ladder.areas[o].head().map(|head| (head, o)))
            .ok_or(AllocError)?;

        // Split the block repeatedly to obtain a suitably sized block. The
        // address of the front half does not change.
        for split_order in (order + 1..=found).rev() {
            block = ladder.split(block, split_order);
        }

        ladder.remove(block, order);

        log::trace!("{}: allocated order-{} block {}", self.name(), order, block);

        Ok(self.map.page_of(block))
    }

    /// Frees the block of `2^order` pages starting at `page`.
    ///
    /// The block is merged with its buddy for as long as the buddy is free.
    ///
    /// # Panics
    ///
    /// Panics if `order` is not less than `ORDERS`, if `page` is not a
    /// multiple of `2^order`, or if the block extends past the managed range.
    ///
    /// The block must have been allocated (or reserved) with this order and
    /// not yet freed. Debug builds panic if any of its pages is already free;
    /// release builds do not check, and freeing a block twice corrupts the
    /// allocator.
    pub fn deallocate(&mut self, page: M::Page, order: usize) {
        assert!(order < ORDERS, "order {order} out of range");

        let block = self.map.pfn_of(page);
        assert!(
            order::is_aligned::<ORDERS>(block, order),
            "{block:?} is misaligned for order {order}"
        );
        assert!(
            self.contains_block(block, order),
            "order-{order} block {block:?} is not managed by this allocator"
        );
        debug_assert!(
            self.free_block_overlapping(block, order).is_none(),
            "order-{order} block {block:?} is already free"
        );

        let mut ladder = self.ladder();
        ladder.insert(block, order);

        let mut block = block;
        let mut order = order;
        while order + 1 < ORDERS {
            match order::buddy_of::<ORDERS>(block, order) {
                Some(buddy) if ladder.is_free(buddy, order) => {
                    block = ladder.merge(block, order);
                    order += 1;
                }

                _ => break,
            }
        }

        log::trace!("{}: freed block, now order-{} block {}", self.name(), order, block);
    }

    /// Removes the single page `page` from the free pool.
    ///
    /// The free block containing `page` is split around it until the page is
    /// isolated; the remaining halves stay free. Reserved pages are returned
    /// with [`deallocate(page, 0)`](Self::deallocate).
    ///
    /// # Errors
    ///
    /// Returns `Err` if the page is not free: it is allocated, already
    /// reserved, or outside the managed range.
    pub fn reserve(&mut self, page: M::Page) -> Result<(), ReserveError> {
        self.reserve_block(page, 0)
    }

    /// Removes the order-`order` block starting at `page` from the free pool.
    ///
    /// This is like [`reserve`](Self::reserve), but stops splitting once a
    /// block of the requested order is isolated.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `order` is not less than `ORDERS`, if `page` is not a
    /// multiple of `2^order`, or if any page of the block is not free.
    pub fn reserve_block(&mut self, page: M::Page, order: usize) -> Result<(), ReserveError> {
        if order >= ORDERS {
            return Err(ReserveError);
        }

        let target = self.map.pfn_of(page);
        if !order::is_aligned::<ORDERS>(target, order) || !self.contains_block(target, order) {
            return Err(ReserveError);
        }

        let (mut block, mut at) = self.find_free_block(target, order).ok_or(ReserveError)?;

        let mut ladder = self.ladder();
        while at > order {
            let left = ladder.split(block, at);
            at -= 1;

            let right = match order::buddy_of::<ORDERS>(left, at) {
                Some(right) if right > left && ladder.is_free(right, at) => right,
                _ => panic!("upper half of split block {left:?} is not free at order {at}"),
            };

            block = if target >= right { right } else { left };
        }

        debug_assert_eq!(block, target);
        ladder.remove(block, order);

        log::trace!("{}: reserved order-{} block {}", self.name(), order, block);

        Ok(())
    }

    /// Returns `true` if `page` is currently free.
    pub fn is_free(&self, page: M::Page) -> bool {
        let pfn = self.map.pfn_of(page);

        self.map.contains(pfn) && self.find_free_block(pfn, 0).is_some()
    }

    /// Returns the number of free blocks of the given order.
    ///
    /// # Panics
    ///
    /// Panics if `order` is not less than `ORDERS`.
    pub fn num_free_blocks(&self, order: usize) -> usize {
        self.areas[order].len()
    }

    /// Returns the total number of free pages.
    pub fn num_free_pages(&self) -> usize {
        self.areas
            .iter()
            .enumerate()
            .map(|(order, area)| area.len() * pages_per_block(order))
            .sum()
    }

    /// Returns an iterator over the free blocks of the given order, in
    /// ascending address order.
    ///
    /// # Panics
    ///
    /// Panics if `order` is not less than `ORDERS`.
    pub fn free_blocks(&self, order: usize) -> FreeBlocks<'_, M> {
        FreeBlocks {
            map: &self.map,
            inner: self.areas[order].iter(self.links()),
        }
    }

    /// Logs the free blocks of every order at `debug` level.
    ///
    /// Each order is logged on its own line as `[order] pfn pfn ...`, with
    /// page-frame numbers in hex.
    pub fn dump_state(&self) {
        let links = self.links();

        log::debug!("{} state:", self.name());
        for (order, area) in self.areas.iter().enumerate() {
            log::debug!("[{}] {}", order, area.display(links));
        }
    }
}

impl<const ORDERS: usize, M, A> fmt::Debug for BuddyAllocator<ORDERS, M, A>
where
    M: PageMap + fmt::Debug,
    A: BackingAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct FreeCounts<'a>(&'a [FreeArea]);

        impl fmt::Debug for FreeCounts<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_list().entries(self.0.iter().map(FreeArea::len)).finish()
            }
        }

        f.debug_struct("BuddyAllocator")
            .field("name", &self.name())
            .field("map", &self.map)
            .field("num_pages", &self.num_pages())
            .field("free_pages", &self.num_free_pages())
            .field("free_blocks", &FreeCounts(&self.areas))
            .finish()
    }
}

/// An iterator over the free blocks of one order of a [`BuddyAllocator`].
///
/// This is returned by [`BuddyAllocator::free_blocks`].
pub struct FreeBlocks<'a, M: PageMap> {
    map: &'a M,
    inner: free_area::Iter<'a>,
}

impl<M: PageMap> Iterator for FreeBlocks<'_, M> {
    type Item = M::Page;

    fn next(&mut self) -> Option<M::Page> {
        self.inner.next().map(|pfn| self.map.page_of(pfn))
    }
}

impl<M: PageMap + fmt::Debug> fmt::Debug for FreeBlocks<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeBlocks").field("map", self.map).finish_non_exhaustive()
    }
}

/// The free lists of every order, borrowed together with their links.
struct Ladder<'a, const ORDERS: usize> {
    areas: &'a mut [FreeArea; ORDERS],
    links: LinkTable<'a>,
}

impl<const ORDERS: usize> Ladder<'_, ORDERS> {
    /// Empties every free list.
    fn clear(&mut self) {
        self.areas.iter_mut().for_each(FreeArea::clear);
        self.links.clear();
    }

    fn is_free(&self, block: Pfn, order: usize) -> bool {
        self.areas[order].contains(self.links.view(), block)
    }

    /// Inserts a free block of the given order.
    fn insert(&mut self, block: Pfn, order: usize) -> Slot {
        debug_assert!(order::is_aligned::<ORDERS>(block, order));

        self.areas[order].insert(&mut self.links, block)
    }

    /// Removes a free block of the given order.
    ///
    /// # Panics
    ///
    /// Panics if the block is not free at that order.
    fn remove(&mut self, block: Pfn, order: usize) {
        self.areas[order].remove(&mut self.links, block);
    }

    /// Splits the free block at `block` into two free blocks of the next
    /// lower order, and returns the lower of the two.
    fn split(&mut self, block: Pfn, order: usize) -> Pfn {
        assert!(order > 0 && order < ORDERS, "cannot split a block of order {order}");
        assert!(
            order::is_aligned::<ORDERS>(block, order),
            "{block:?} is misaligned for order {order}"
        );

        self.remove(block, order);

        let half = order - 1;
        let upper = block
            .checked_add(pages_per_block(half))
            .expect("split block overflows the pfn space");

        self.insert(block, half);
        self.insert(upper, half);

        block
    }

    /// Merges the free block at `block` with its free buddy, and returns the
    /// merged block of the next higher order.
    ///
    /// # Panics
    ///
    /// Panics if `order` is the highest order or either block is not free.
    fn merge(&mut self, block: Pfn, order: usize) -> Pfn {
        assert!(order + 1 < ORDERS, "cannot merge blocks of order {order}");

        let buddy = order::buddy_of::<ORDERS>(block, order)
            .unwrap_or_else(|| panic!("{block:?} has no buddy at order {order}"));

        self.remove(buddy, order);
        self.remove(block, order);

        let merged = cmp::min(block, buddy);
        self.insert(merged, order + 1);

        merged
    }
}

/// Like a `BuddyAllocator`, but without a `Drop` impl or an associated
/// allocator.
///
/// This assists in tacking on the allocator type parameter because this struct can be
/// moved out of, while `BuddyAllocator` itself cannot.
struct BuddyAllocatorParts<const ORDERS: usize, M: PageMap> {
    metadata: NonNull<FreeLink>,
    map: M,
    areas: [FreeArea; ORDERS],
}

impl<const ORDERS: usize, M: PageMap> BuddyAllocatorParts<ORDERS, M> {
    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> BuddyAllocator<ORDERS, M, A> {
        let BuddyAllocatorParts {
            metadata,
            map,
            areas,
        } = self;

        BuddyAllocator {
            metadata,
            map,
            areas,
            backing_allocator,
        }
    }

    /// Constructs a new `BuddyAllocatorParts` from a raw metadata pointer.
    ///
    /// Every link is initialized, but no page is free.
    ///
    /// # Safety
    ///
    /// `metadata` must be a pointer to a region that satisfies the [`Layout`]
    /// returned by `BuddyAllocator::metadata_layout(map.num_pages())`, and it
    /// must be valid for reads and writes for the entire size indicated by
    /// that `Layout`.
    unsafe fn new(metadata: NonNull<u8>, map: M) -> BuddyAllocatorParts<ORDERS, M> {
        let metadata = metadata.cast::<FreeLink>();

        assert_eq!(
            metadata.as_ptr().align_offset(mem::align_of::<FreeLink>()),
            0,
            "misaligned metadata region"
        );

        for idx in 0..map.num_pages() {
            unsafe { metadata.as_ptr().add(idx).write(FreeLink::default()) };
        }

        BuddyAllocatorParts {
            metadata,
            map,
            areas: [FreeArea::new(); ORDERS],
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{format, prelude::rust_2021::*, vec};

    use super::*;
    use crate::page::{PageDescriptors, PfnRange};

    fn pfn(raw: usize) -> Pfn {
        Pfn::new(raw)
    }

    fn new_with_global<const ORDERS: usize>(
        base: usize,
        num_pages: usize,
    ) -> BuddyAllocator<ORDERS, PfnRange, Global> {
        BuddyAllocator::try_new(PfnRange::new(pfn(base), num_pages)).unwrap()
    }

    /// Returns the raw page-frame numbers of the free blocks of each order.
    fn free_lists<const ORDERS: usize, M, A>(buddy: &BuddyAllocator<ORDERS, M, A>) -> Vec<Vec<usize>>
    where
        M: PageMap,
        A: BackingAllocator,
    {
        (0..ORDERS)
            .map(|order| {
                buddy
                    .free_blocks(order)
                    .map(|page| buddy.map().pfn_of(page).get())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn create_and_destroy() {
        let buddy = new_with_global::<8>(0, 1024);
        assert_eq!(buddy.num_pages(), 1024);
        assert_eq!(buddy.num_free_pages(), 1024);
        assert_eq!(buddy.name(), "buddy");
    }

    #[test]
    fn init_single_top_block() {
        let buddy = new_with_global::<5>(0, 16);
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![], vec![], vec![0]]);
    }

    #[test]
    fn init_chains_top_blocks() {
        let buddy = new_with_global::<5>(0, 48);
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![], vec![], vec![0, 16, 32]]);
    }

    #[test]
    fn init_covers_remainder() {
        let buddy = new_with_global::<5>(0, 21);
        assert_eq!(free_lists(&buddy), [vec![20], vec![], vec![16], vec![], vec![0]]);
        assert_eq!(buddy.num_free_pages(), 21);
    }

    #[test]
    fn init_unaligned_base() {
        let buddy = new_with_global::<5>(3, 13);
        assert_eq!(free_lists(&buddy), [vec![3], vec![], vec![4], vec![8], vec![]]);
    }

    #[test]
    fn init_rejects_empty_map() {
        let res = BuddyAllocator::<5, _, Global>::try_new(PfnRange::new(pfn(0), 0));
        assert_eq!(res.unwrap_err(), AllocInitError::InvalidConfig);
    }

    #[test]
    fn init_rejects_too_many_orders() {
        let res = BuddyAllocator::<64, _, Global>::try_new(PfnRange::new(pfn(0), 16));
        assert_eq!(res.unwrap_err(), AllocInitError::InvalidConfig);
    }

    #[test]
    fn reinit_forgets_allocations() {
        let mut buddy = new_with_global::<5>(0, 32);
        buddy.allocate(3).unwrap();
        buddy.reserve(pfn(30)).unwrap();

        buddy.init().unwrap();
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![], vec![], vec![0, 16]]);
    }

    #[test]
    fn alloc_splits_cascade() {
        let mut buddy = new_with_global::<5>(0, 16);

        let block = buddy.allocate(0).unwrap();
        assert_eq!(block, pfn(0));
        assert_eq!(free_lists(&buddy), [vec![1], vec![2], vec![4], vec![8], vec![]]);

        buddy.deallocate(block, 0);
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![], vec![], vec![0]]);
    }

    #[test]
    fn alloc_free_round_trip_from_fragmented_state() {
        let mut buddy = new_with_global::<5>(0, 40);
        buddy.reserve(pfn(5)).unwrap();
        buddy.reserve(pfn(21)).unwrap();
        let held = buddy.allocate(1).unwrap();

        let before = free_lists(&buddy);
        for order in 0..5 {
            if let Ok(block) = buddy.allocate(order) {
                buddy.deallocate(block, order);
            }
            assert_eq!(free_lists(&buddy), before, "order {order}");
        }

        buddy.deallocate(held, 1);
    }

    #[test]
    fn alloc_prefers_lowest_sufficient_order() {
        let mut buddy = new_with_global::<5>(0, 16);
        buddy.allocate(0).unwrap();

        // Order 1 has a free block, so nothing larger is split.
        assert_eq!(buddy.allocate(1), Ok(pfn(2)));
        assert_eq!(free_lists(&buddy), [vec![1], vec![], vec![4], vec![8], vec![]]);

        // Order 1 is now empty, so the order-2 block is split.
        assert_eq!(buddy.allocate(1), Ok(pfn(4)));
        assert_eq!(free_lists(&buddy), [vec![1], vec![6], vec![], vec![8], vec![]]);
    }

    #[test]
    fn alloc_takes_lowest_address() {
        let mut buddy = new_with_global::<3>(0, 16);

        assert_eq!(buddy.allocate(2), Ok(pfn(0)));
        assert_eq!(buddy.allocate(2), Ok(pfn(4)));
        assert_eq!(buddy.allocate(2), Ok(pfn(8)));
        assert_eq!(buddy.allocate(2), Ok(pfn(12)));
        assert_eq!(buddy.allocate(0), Err(AllocError));
    }

    #[test]
    fn alloc_rejects_large_order() {
        let mut buddy = new_with_global::<5>(0, 16);

        assert_eq!(buddy.allocate(5), Err(AllocError));
        assert_eq!(buddy.allocate(usize::MAX), Err(AllocError));
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![], vec![], vec![0]]);
    }

    #[test]
    fn alloc_exhaustion_leaves_state() {
        let mut buddy = new_with_global::<5>(0, 20);

        assert_eq!(buddy.allocate(4), Ok(pfn(0)));
        assert_eq!(buddy.allocate(3), Err(AllocError));
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![16], vec![], vec![]]);
    }

    #[test]
    fn alloc_is_aligned() {
        let mut buddy = new_with_global::<6>(0, 100);

        for order in [0, 3, 1, 5, 2, 0, 4] {
            let block = buddy.allocate(order).unwrap();
            assert_eq!(block.get() % pages_per_block(order), 0);
        }
    }

    #[test]
    fn coalesce_in_any_order() {
        let mut buddy = new_with_global::<4>(0, 8);

        let blocks: Vec<Pfn> = (0..8).map(|_| buddy.allocate(0).unwrap()).collect();
        assert_eq!(buddy.num_free_pages(), 0);

        for &idx in &[5, 0, 7, 2, 1, 6, 3, 4] {
            buddy.deallocate(blocks[idx], 0);
        }

        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![], vec![0]]);
    }

    #[test]
    fn free_stops_at_allocated_buddy() {
        let mut buddy = new_with_global::<3>(0, 4);

        let a = buddy.allocate(0).unwrap();
        let b = buddy.allocate(0).unwrap();
        assert_eq!(free_lists(&buddy), [vec![], vec![2], vec![]]);

        buddy.deallocate(a, 0);
        assert_eq!(free_lists(&buddy), [vec![0], vec![2], vec![]]);

        buddy.deallocate(b, 0);
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![0]]);
    }

    #[test]
    #[should_panic(expected = "misaligned")]
    fn free_misaligned_panics() {
        let mut buddy = new_with_global::<5>(0, 16);
        let _ = buddy.allocate(1).unwrap();
        buddy.deallocate(pfn(1), 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn free_bad_order_panics() {
        let mut buddy = new_with_global::<5>(0, 16);
        buddy.deallocate(pfn(0), 5);
    }

    #[test]
    #[should_panic(expected = "not managed")]
    fn free_outside_range_panics() {
        let mut buddy = new_with_global::<5>(0, 16);
        buddy.deallocate(pfn(16), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_panics_in_debug() {
        let mut buddy = new_with_global::<5>(0, 16);
        let block = buddy.allocate(2).unwrap();
        buddy.deallocate(block, 2);
        buddy.deallocate(block, 2);
    }

    #[test]
    fn reserve_isolates_page() {
        let mut buddy = new_with_global::<5>(0, 16);

        assert_eq!(buddy.reserve(pfn(5)), Ok(()));
        assert_eq!(free_lists(&buddy), [vec![4], vec![6], vec![0], vec![8], vec![]]);
        assert_eq!(buddy.num_free_pages(), 15);
        assert!(!buddy.is_free(pfn(5)));
        assert!(buddy.is_free(pfn(4)));
        assert!(buddy.is_free(pfn(15)));
    }

    #[test]
    fn reserve_from_non_lowest_order() {
        let mut buddy = new_with_global::<5>(0, 32);
        buddy.allocate(0).unwrap();

        // Page 20 lives in the order-4 block at 16, not in any of the
        // lower-order remnants of the first split.
        assert_eq!(buddy.reserve(pfn(20)), Ok(()));
        assert_eq!(
            free_lists(&buddy),
            [vec![1, 21], vec![2, 22], vec![4, 16], vec![8, 24], vec![]]
        );
    }

    #[test]
    fn reserve_fails_when_not_free() {
        let mut buddy = new_with_global::<5>(0, 16);

        assert_eq!(buddy.reserve(pfn(5)), Ok(()));
        assert_eq!(buddy.reserve(pfn(5)), Err(ReserveError));

        let block = buddy.allocate(2).unwrap();
        assert_eq!(block, pfn(0));
        assert_eq!(buddy.reserve(pfn(2)), Err(ReserveError));

        assert_eq!(buddy.reserve(pfn(16)), Err(ReserveError));
        assert_eq!(buddy.reserve(pfn(usize::MAX)), Err(ReserveError));
    }

    #[test]
    fn reserved_page_is_freed_like_an_allocation() {
        let mut buddy = new_with_global::<5>(0, 16);

        buddy.reserve(pfn(11)).unwrap();
        buddy.deallocate(pfn(11), 0);
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![], vec![], vec![0]]);
    }

    #[test]
    fn reserve_every_page() {
        let mut buddy = new_with_global::<4>(0, 24);

        for raw in (0..24).rev() {
            assert_eq!(buddy.reserve(pfn(raw)), Ok(()));
        }

        assert_eq!(buddy.num_free_pages(), 0);
        assert_eq!(buddy.allocate(0), Err(AllocError));
    }

    #[test]
    fn reserve_block_stops_at_order() {
        let mut buddy = new_with_global::<5>(0, 16);

        assert_eq!(buddy.reserve_block(pfn(8), 3), Ok(()));
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![], vec![0], vec![]]);

        assert_eq!(buddy.reserve_block(pfn(4), 3), Err(ReserveError));
        assert_eq!(buddy.reserve_block(pfn(8), 3), Err(ReserveError));
        assert_eq!(buddy.reserve_block(pfn(0), 5), Err(ReserveError));

        buddy.deallocate(pfn(8), 3);
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![], vec![], vec![0]]);
    }

    #[test]
    fn reserve_block_rejects_partly_allocated_block() {
        let mut buddy = new_with_global::<5>(0, 16);

        buddy.reserve(pfn(9)).unwrap();
        assert_eq!(buddy.reserve_block(pfn(8), 2), Err(ReserveError));
        assert_eq!(buddy.reserve_block(pfn(12), 2), Ok(()));
    }

    #[test]
    fn nonzero_base() {
        let mut buddy = new_with_global::<4>(0x1000, 16);

        let a = buddy.allocate(3).unwrap();
        assert_eq!(a, pfn(0x1000));
        assert_eq!(buddy.reserve(pfn(0x100c)), Ok(()));
        assert_eq!(buddy.reserve(pfn(0xfff)), Err(ReserveError));

        buddy.deallocate(a, 3);
        buddy.deallocate(pfn(0x100c), 0);
        assert_eq!(free_lists(&buddy), [vec![], vec![], vec![], vec![0x1000, 0x1008]]);
    }

    #[test]
    fn descriptor_handles() {
        #[derive(Clone, Default)]
        struct Descriptor {
            refcount: u32,
        }

        let mut table = vec![Descriptor::default(); 32];
        let map = PageDescriptors::new(&mut table, pfn(64));
        let mut buddy = BuddyAllocator::<4, _, Global>::try_new(map).unwrap();

        let page = buddy.allocate(1).unwrap();
        assert_eq!(buddy.map().pfn_of(page), pfn(64));

        unsafe {
            // The handle points into the descriptor table.
            (*page.as_ptr()).refcount += 1;
            assert_eq!((*page.as_ptr()).refcount, 1);
        }

        let target = buddy.map().page_of(pfn(90));
        assert_eq!(buddy.reserve(target), Ok(()));
        assert!(!buddy.is_free(target));

        buddy.deallocate(target, 0);
        buddy.deallocate(page, 1);
        assert_eq!(buddy.num_free_blocks(3), 4);
    }

    #[test]
    fn raw_metadata_round_trip() {
        type Buddy = BuddyAllocator<4, PfnRange, Raw>;

        let layout = Buddy::metadata_layout(16).unwrap();
        let mut storage = vec![FreeLink::default(); 16];
        assert_eq!(layout.size(), mem::size_of_val(&storage[..]));

        let metadata = NonNull::new(storage.as_mut_ptr()).unwrap().cast::<u8>();
        let map = PfnRange::new(pfn(0), 16);
        let mut buddy = unsafe { Buddy::new_raw(metadata, map) }.unwrap();

        assert_eq!(buddy.allocate(3), Ok(pfn(0)));

        let (ptr, map) = buddy.into_raw_parts();
        assert_eq!(ptr, metadata);
        assert_eq!(map.num_pages(), 16);
    }

    #[test]
    fn debug_and_dump() {
        let mut buddy = new_with_global::<3>(0, 8);
        buddy.reserve(pfn(1)).unwrap();
        buddy.dump_state();

        let dbg = format!("{buddy:?}");
        assert!(dbg.contains("free_pages: 7"), "{dbg}");
        assert!(dbg.contains("free_blocks: [1, 1, 1]"), "{dbg}");
    }
}
