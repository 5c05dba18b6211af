//! Page-frame numbers and the translation between page handles and them.
//!
//! The buddy allocator works entirely in terms of page-frame numbers. Callers
//! usually think in terms of some other page handle, such as a pointer to a
//! per-page descriptor. A [`PageMap`] converts between the two.

use core::{fmt, marker::PhantomData, mem, num::NonZeroUsize, ptr::NonNull};

#[cfg(not(feature = "unstable"))]
use crate::polyfill::NonNullStrict;

/// A page-frame number.
///
/// Page-frame numbers index fixed-size physical pages; adjacent page frames
/// have adjacent numbers.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pfn(usize);

impl Pfn {
    /// Creates a `Pfn` from a raw page-frame number.
    #[inline]
    pub const fn new(raw: usize) -> Pfn {
        Pfn(raw)
    }

    /// Returns the raw page-frame number.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns the page-frame number `pages` frames after `self`, or `None`
    /// on overflow.
    #[inline]
    pub const fn checked_add(self, pages: usize) -> Option<Pfn> {
        match self.0.checked_add(pages) {
            Some(raw) => Some(Pfn(raw)),
            None => None,
        }
    }

    /// Returns the page-frame number `pages` frames before `self`, or `None`
    /// on underflow.
    #[inline]
    pub const fn checked_sub(self, pages: usize) -> Option<Pfn> {
        match self.0.checked_sub(pages) {
            Some(raw) => Some(Pfn(raw)),
            None => None,
        }
    }

    /// Returns the number of page frames from `earlier` to `self`, or `None`
    /// if `earlier` comes after `self`.
    #[inline]
    pub const fn pages_since(self, earlier: Pfn) -> Option<usize> {
        self.0.checked_sub(earlier.0)
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<Pfn> for usize {
    #[inline]
    fn from(pfn: Pfn) -> usize {
        pfn.0
    }
}

/// A bijection between page handles and the page-frame numbers of a
/// contiguous range of pages.
///
/// The range managed through a `PageMap` is `base()..base() + num_pages()`.
/// `pfn_of` and `page_of` must be inverses of each other over that range; the
/// allocator never calls `page_of` with a page-frame number outside it.
pub trait PageMap {
    /// The caller's handle for a single page.
    type Page: Copy + Eq + fmt::Debug;

    /// Returns the page-frame number of the first page in the range.
    fn base(&self) -> Pfn;

    /// Returns the number of pages in the range.
    fn num_pages(&self) -> usize;

    /// Returns the page-frame number of `page`.
    fn pfn_of(&self, page: Self::Page) -> Pfn;

    /// Returns the handle of the page with page-frame number `pfn`.
    fn page_of(&self, pfn: Pfn) -> Self::Page;

    /// Returns `true` if `pfn` lies within the range.
    #[inline]
    fn contains(&self, pfn: Pfn) -> bool {
        pfn.pages_since(self.base())
            .is_some_and(|idx| idx < self.num_pages())
    }
}

/// A contiguous range of page-frame numbers whose page handles are the
/// page-frame numbers themselves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PfnRange {
    base: Pfn,
    num_pages: usize,
}

impl PfnRange {
    /// Creates a range of `num_pages` pages starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if the end of the range overflows a `usize`.
    pub fn new(base: Pfn, num_pages: usize) -> PfnRange {
        base.checked_add(num_pages)
            .expect("pfn range limit overflows usize");

        PfnRange { base, num_pages }
    }
}

impl PageMap for PfnRange {
    type Page = Pfn;

    #[inline]
    fn base(&self) -> Pfn {
        self.base
    }

    #[inline]
    fn num_pages(&self) -> usize {
        self.num_pages
    }

    #[inline]
    fn pfn_of(&self, page: Pfn) -> Pfn {
        page
    }

    #[inline]
    fn page_of(&self, pfn: Pfn) -> Pfn {
        pfn
    }
}

/// A table of per-page descriptors, one for each page frame in a range.
///
/// The page handle is a pointer to the page's descriptor. The descriptor at
/// index `i` describes page frame `base_pfn + i`.
pub struct PageDescriptors<'a, T> {
    base: NonNull<T>,
    base_pfn: Pfn,
    num_pages: usize,
    _descriptors: PhantomData<&'a mut [T]>,
}

impl<'a, T> PageDescriptors<'a, T> {
    /// Creates a map over `descriptors`, whose first entry describes the page
    /// frame `base_pfn`.
    ///
    /// The returned value assumes the provenance of `descriptors`; page
    /// handles it produces may be dereferenced for as long as it exists.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized or if the end of the page-frame range
    /// overflows a `usize`.
    pub fn new(descriptors: &'a mut [T], base_pfn: Pfn) -> PageDescriptors<'a, T> {
        assert!(
            mem::size_of::<T>() != 0,
            "page descriptors must not be zero-sized"
        );
        base_pfn
            .checked_add(descriptors.len())
            .expect("pfn range limit overflows usize");

        let num_pages = descriptors.len();

        PageDescriptors {
            base: NonNull::from(descriptors).cast(),
            base_pfn,
            num_pages,
            _descriptors: PhantomData,
        }
    }

    /// Returns the index of the descriptor `page` points to.
    fn index_of(&self, page: NonNull<T>) -> usize {
        let ofs = page
            .addr()
            .get()
            .checked_sub(self.base.addr().get())
            .expect("page descriptor precedes the descriptor table");

        debug_assert_eq!(ofs % mem::size_of::<T>(), 0, "misaligned page descriptor");

        let idx = ofs / mem::size_of::<T>();
        assert!(idx < self.num_pages, "page descriptor outside the descriptor table");

        idx
    }
}

impl<T> fmt::Debug for PageDescriptors<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageDescriptors")
            .field("base", &self.base)
            .field("base_pfn", &self.base_pfn)
            .field("num_pages", &self.num_pages)
            .finish()
    }
}

impl<T> PageMap for PageDescriptors<'_, T> {
    type Page = NonNull<T>;

    #[inline]
    fn base(&self) -> Pfn {
        self.base_pfn
    }

    #[inline]
    fn num_pages(&self) -> usize {
        self.num_pages
    }

    fn pfn_of(&self, page: NonNull<T>) -> Pfn {
        let idx = self.index_of(page);

        // Cannot overflow: checked against the range limit in `new()`.
        Pfn(self.base_pfn.0 + idx)
    }

    fn page_of(&self, pfn: Pfn) -> NonNull<T> {
        let idx = pfn
            .pages_since(self.base_pfn)
            .filter(|&idx| idx < self.num_pages)
            .expect("pfn outside the descriptor table");

        let addr = idx
            .checked_mul(mem::size_of::<T>())
            .and_then(|ofs| self.base.addr().get().checked_add(ofs))
            .and_then(NonZeroUsize::new)
            .expect("descriptor address overflows usize");

        // The descriptor inherits the provenance of the table.
        self.base.with_addr(addr)
    }
}
