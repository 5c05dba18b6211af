//! Free lists of buddy blocks.
//!
//! Each order of the allocator has one [`FreeArea`]: a singly linked list of
//! the free blocks of that order, kept sorted by ascending page-frame number.
//! The links are not stored in the pages themselves. Instead, every managed
//! page owns one [`FreeLink`] in an out-of-band [`LinkTable`], and a block is
//! linked through the entry of its first page.

use core::fmt;

use crate::page::Pfn;

/// A link in a free list of blocks.
///
/// Only the link of a free block's first page is meaningful. The links of all
/// other pages are `None`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct FreeLink {
    // Page-frame numbers rather than indices: the table translates them,
    // so a list can be printed or compared without consulting the table.
    pub next: Option<Pfn>,
}

/// A read-only view of the free-list links of a contiguous range of pages.
#[derive(Copy, Clone)]
pub struct Links<'a> {
    base: Pfn,
    links: &'a [FreeLink],
}

impl<'a> Links<'a> {
    /// Creates a view of the links of the pages starting at `base`.
    pub fn new(base: Pfn, links: &'a [FreeLink]) -> Links<'a> {
        Links { base, links }
    }

    /// Returns the successor of `pfn` in its free list.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` is not managed by this table.
    #[inline]
    pub fn next(self, pfn: Pfn) -> Option<Pfn> {
        self.links[index_of(self.base, self.links.len(), pfn)].next
    }
}

/// The free-list links of a contiguous range of pages.
pub struct LinkTable<'a> {
    base: Pfn,
    links: &'a mut [FreeLink],
}

impl<'a> LinkTable<'a> {
    /// Creates a link table for the pages starting at `base`.
    pub fn new(base: Pfn, links: &'a mut [FreeLink]) -> LinkTable<'a> {
        LinkTable { base, links }
    }

    /// Returns a read-only view of the table.
    #[inline]
    pub fn view(&self) -> Links<'_> {
        Links::new(self.base, self.links)
    }

    /// Sets the successor of `pfn` in its free list.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` is not managed by this table.
    #[inline]
    pub fn set_next(&mut self, pfn: Pfn, next: Option<Pfn>) {
        let idx = index_of(self.base, self.links.len(), pfn);
        self.links[idx].next = next;
    }

    /// Unlinks every page.
    pub fn clear(&mut self) {
        self.links.fill(FreeLink::default());
    }
}

#[inline]
fn index_of(base: Pfn, len: usize, pfn: Pfn) -> usize {
    pfn.pages_since(base)
        .filter(|&idx| idx < len)
        .unwrap_or_else(|| panic!("{pfn:?} is not managed by this allocator"))
}

/// The position of a block within a free list.
///
/// Removing the block at a known slot does not require another search.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    /// The block is the head of the list.
    Head,
    /// The block directly follows the given block.
    After(Pfn),
}

/// A sorted free list of blocks of a single order.
#[derive(Copy, Clone, Debug, Default)]
pub struct FreeArea {
    head: Option<Pfn>,
    len: usize,
}

impl FreeArea {
    /// Returns an empty free list.
    pub const fn new() -> FreeArea {
        FreeArea { head: None, len: 0 }
    }

    /// Returns the lowest-addressed block in the list.
    #[inline]
    pub fn head(&self) -> Option<Pfn> {
        self.head
    }

    #[inline]
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Empties the list without touching any links.
    pub fn clear(&mut self) {
        *self = FreeArea::new();
    }

    /// Returns the block at `slot`.
    fn at(&self, links: Links<'_>, slot: Slot) -> Option<Pfn> {
        match slot {
            Slot::Head => self.head,
            Slot::After(prev) => links.next(prev),
        }
    }

    /// Points `slot` at `block`.
    fn set(&mut self, links: &mut LinkTable<'_>, slot: Slot, block: Option<Pfn>) {
        match slot {
            Slot::Head => self.head = block,
            Slot::After(prev) => links.set_next(prev, block),
        }
    }

    /// Returns the first slot whose block is not below `block`.
    fn lower_bound(&self, links: Links<'_>, block: Pfn) -> Slot {
        let mut slot = Slot::Head;

        while let Some(cur) = self.at(links, slot) {
            if cur >= block {
                break;
            }

            slot = Slot::After(cur);
        }

        slot
    }

    /// Locates `block` in the list.
    ///
    /// The search stops at the first block above `block`.
    pub fn find(&self, links: Links<'_>, block: Pfn) -> Option<Slot> {
        let slot = self.lower_bound(links, block);

        (self.at(links, slot) == Some(block)).then_some(slot)
    }

    #[inline]
    pub fn contains(&self, links: Links<'_>, block: Pfn) -> bool {
        self.find(links, block).is_some()
    }

    /// Inserts `block` in address order and returns the slot it now occupies.
    ///
    /// # Panics
    ///
    /// Panics if `block` is already in the list.
    pub fn insert(&mut self, links: &mut LinkTable<'_>, block: Pfn) -> Slot {
        let slot = self.lower_bound(links.view(), block);
        let next = self.at(links.view(), slot);

        assert_ne!(next, Some(block), "{block:?} is already in the free list");

        links.set_next(block, next);
        self.set(links, slot, Some(block));
        self.len += 1;

        slot
    }

    /// Appends `block` after `tail`, the current last block of the list.
    ///
    /// This is used to build a list in ascending order without searching it.
    pub fn append(&mut self, links: &mut LinkTable<'_>, tail: Option<Pfn>, block: Pfn) {
        debug_assert!(tail.map_or(self.head.is_none(), |t| {
            t < block && links.view().next(t).is_none()
        }));

        let slot = match tail {
            Some(t) => Slot::After(t),
            None => Slot::Head,
        };

        links.set_next(block, None);
        self.set(links, slot, Some(block));
        self.len += 1;
    }

    /// Unlinks the block at `slot` and returns it.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is past the end of the list.
    pub fn unlink(&mut self, links: &mut LinkTable<'_>, slot: Slot) -> Pfn {
        let block = self
            .at(links.view(), slot)
            .expect("unlink from a slot past the end of the free list");

        let next = links.view().next(block);
        self.set(links, slot, next);
        links.set_next(block, None);
        self.len -= 1;

        block
    }

    /// Removes `block` from the list.
    ///
    /// # Panics
    ///
    /// Panics if `block` is not in the list. Callers must only remove blocks
    /// they know to be free at this order.
    pub fn remove(&mut self, links: &mut LinkTable<'_>, block: Pfn) {
        match self.find(links.view(), block) {
            Some(slot) => {
                self.unlink(links, slot);
            }

            None => panic!("missing {block:?} in free list"),
        }
    }

    /// Returns an iterator over the blocks in the list, in ascending order.
    pub fn iter<'a>(&self, links: Links<'a>) -> Iter<'a> {
        Iter {
            links,
            next: self.head,
        }
    }

    /// Returns a value that formats the list as space-separated page-frame
    /// numbers in hex.
    pub fn display<'a>(&self, links: Links<'a>) -> Display<'a> {
        Display {
            links,
            head: self.head,
        }
    }
}

/// An iterator over the blocks of a [`FreeArea`].
pub struct Iter<'a> {
    links: Links<'a>,
    next: Option<Pfn>,
}

impl Iterator for Iter<'_> {
    type Item = Pfn;

    fn next(&mut self) -> Option<Pfn> {
        let cur = self.next?;
        self.next = self.links.next(cur);
        Some(cur)
    }
}

pub struct Display<'a> {
    links: Links<'a>,
    head: Option<Pfn>,
}

impl fmt::Display for Display<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let iter = Iter {
            links: self.links,
            next: self.head,
        };

        for (i, block) in iter.enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }

            write!(f, "{block:x}")?;
        }

        Ok(())
    }
}
