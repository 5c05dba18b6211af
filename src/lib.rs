//! A bare metal-friendly buddy page-frame allocator.
//!
//! [`BuddyAllocator`] manages a fixed range of page frames and hands out
//! naturally-aligned blocks of `2^order` contiguous pages. Freed blocks are
//! coalesced with their buddies as soon as both halves are free, and single
//! pages can be carved out of the free pool at a fixed location with
//! [`BuddyAllocator::reserve`].
//!
//! The allocator never touches page memory. Pages are identified by their
//! page-frame number ([`Pfn`]), and the translation between a caller's page
//! handles and page-frame numbers is provided by a [`PageMap`]. Free-list
//! links are kept out-of-band in a small metadata table holding one link per
//! managed page.
//!
//! ## Example
//!
//! ```
//! use core::{mem, ptr::NonNull};
//!
//! use buddy_pages::{BuddyAllocator, Pfn, PfnRange, Raw};
//!
//! // 64 pages, blocks of up to 2^4 = 16 pages.
//! type Buddy = BuddyAllocator<5, PfnRange, Raw>;
//!
//! let mut metadata = [0_usize; 128];
//! assert!(Buddy::metadata_layout(64).unwrap().size() <= mem::size_of_val(&metadata));
//!
//! let map = PfnRange::new(Pfn::new(0), 64);
//! let mut buddy = unsafe { Buddy::new_raw(NonNull::from(&mut metadata).cast(), map) }.unwrap();
//!
//! let block = buddy.allocate(2).unwrap();
//! assert_eq!(block.get() % 4, 0);
//!
//! assert!(buddy.reserve(Pfn::new(17)).is_ok());
//! assert!(buddy.reserve(Pfn::new(17)).is_err());
//!
//! buddy.deallocate(block, 2);
//! ```

#![doc(html_root_url = "https://docs.rs/buddy_pages/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(feature = "unstable", feature(allocator_api))]
#![cfg_attr(
    all(feature = "unstable", not(feature = "sptr")),
    feature(strict_provenance)
)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by unstable features.
#![allow(unstable_name_collisions)]

macro_rules! requires_sptr_or_unstable {
    ($($it:item)*) => {
        $(
            #[cfg(any(feature = "sptr", feature = "unstable"))]
            $it
        )*
    };
}

#[cfg(not(any(feature = "sptr", feature = "unstable")))]
compile_error!("At least one of these crate features must be enabled: [\"sptr\", \"unstable\"].");

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

requires_sptr_or_unstable! {
    pub mod buddy;
    mod free_area;
    pub mod order;
    pub mod page;
    pub mod sync;

    #[cfg(not(feature = "unstable"))]
    mod polyfill;


    use core::{alloc::Layout, fmt, ptr::NonNull};

    #[cfg(feature = "unstable")]
    use core::alloc::Allocator;

    pub use crate::{
        buddy::{BuddyAllocator, DefaultBuddyAllocator, FreeBlocks},
        order::MAX_ORDER,
        page::{PageDescriptors, PageMap, Pfn, PfnRange},
        sync::{RefCellBuddyAllocator, SpinBuddyAllocator},
    };

    #[cfg(feature = "std")]
    pub use crate::sync::MutexBuddyAllocator;

    #[cfg(feature = "unstable")]
    pub use core::alloc::AllocError;

    #[cfg(all(any(feature = "alloc", test), feature = "unstable"))]
    pub use alloc::alloc::Global;

    /// The error type for allocator constructors.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum AllocInitError {
        /// A necessary allocation failed.
        ///
        /// This variant is returned when a constructor attempts to allocate
        /// memory for the free-list metadata, but the underlying allocator
        /// fails.
        ///
        /// The variant contains the [`Layout`] that could not be allocated.
        AllocFailed(Layout),

        /// The configuration of the allocator is invalid.
        ///
        /// This variant is returned when an allocator's configuration
        /// parameters are impossible to satisfy, e.g. when the page map
        /// contains no pages.
        InvalidConfig,
    }

    impl fmt::Display for AllocInitError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                AllocInitError::AllocFailed(layout) => write!(
                    f,
                    "failed to allocate allocator metadata (size {}, align {})",
                    layout.size(),
                    layout.align()
                ),
                AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
            }
        }
    }

    /// Indicates an allocation failure due to resource exhaustion or an unsupported
    /// set of arguments.
    #[cfg(not(feature = "unstable"))]
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct AllocError;

    #[cfg(not(feature = "unstable"))]
    impl fmt::Display for AllocError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("no free block of the requested order")
        }
    }

    /// Indicates that a page could not be reserved because it is not currently
    /// free.
    ///
    /// This is returned when the page is already allocated or reserved, lies
    /// outside the managed range, or (for [`BuddyAllocator::reserve_block`])
    /// does not start a block of the requested order.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct ReserveError;

    impl fmt::Display for ReserveError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("page is not free")
        }
    }

    /// Types which provide the memory backing an allocator's metadata.
    ///
    /// This is a supertrait of [`Allocator`], and is implemented by the following types:
    /// - The `Raw` marker type indicates that an allocator is not backed by another
    ///   allocator. This is the case when constructing the allocator from raw
    ///   pointers. Memory used by this allocator can be reclaimed using
    ///   `.into_raw_parts()`.
    /// - The `Global` marker type indicates that an allocator is backed by the
    ///   global allocator. The allocator will free its memory on drop.
    /// - Any type `A` which implements [`Allocator`] indicates that an allocator is
    ///   backed by an instance of `A`. The allocator will free its memory on drop.
    ///
    /// [`Allocator`]: https://doc.rust-lang.org/stable/core/alloc/trait.Allocator.html
    pub trait BackingAllocator: Sealed {
        /// Deallocates the memory referenced by `ptr`.
        ///
        /// # Safety
        ///
        /// * `ptr` must denote a block of memory [*currently allocated*] via this allocator, and
        /// * `layout` must [*fit*] that block of memory.
        ///
        /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
        /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
    }

    /// A marker type indicating that an allocator is backed by raw pointers.
    #[derive(Clone, Debug)]
    pub struct Raw;
    impl Sealed for Raw {}
    impl BackingAllocator for Raw {
        unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
    }

    #[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
    /// The global memory allocator.
    #[derive(Clone, Debug)]
    pub struct Global;

    #[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
    impl Sealed for Global {}

    #[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
    impl BackingAllocator for Global {
        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    #[cfg(feature = "unstable")]
    impl<A: Allocator> Sealed for A {}
    #[cfg(feature = "unstable")]
    impl<A: Allocator> BackingAllocator for A {
        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            unsafe { Allocator::deallocate(self, ptr, layout) };
        }
    }

    #[doc(hidden)]
    mod private {
        pub trait Sealed {}
    }
    use private::Sealed;
}
