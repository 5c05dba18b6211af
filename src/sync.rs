//! Buddy allocators behind a lock.
//!
//! The allocator itself requires `&mut self` for every mutating operation. The
//! wrappers in this module provide the same operations through `&self`, with
//! each call holding the lock for its whole duration.
//!
//! A panic inside an operation may leave the free lists half updated. Every
//! wrapper therefore poisons itself when an operation unwinds, and panics on
//! any later use.

use core::{
    cell::RefCell,
    fmt, mem,
    sync::atomic::{AtomicBool, Ordering},
};

#[cfg(feature = "std")]
use std::sync::{Mutex, MutexGuard};

use crate::{buddy::BuddyAllocator, page::PageMap, AllocError, BackingAllocator, ReserveError};

macro_rules! declare_wrappers {
    ($($(#[$attr:meta])* $wrapper:ident uses $typename:ty, via $lock:path, into $into:path;)*) => {
        $(
            #[doc = concat!("A `BuddyAllocator` wrapped by a `", stringify!($typename), "`.")]
            $(#[$attr])*
            pub struct $wrapper<const ORDERS: usize, M: PageMap, A: BackingAllocator> {
                inner: $typename,
                poisoned: AtomicBool,
            }

            $(#[$attr])*
            impl<const ORDERS: usize, M: PageMap, A: BackingAllocator> $wrapper<ORDERS, M, A> {
                /// Wraps `buddy`.
                pub fn new(buddy: BuddyAllocator<ORDERS, M, A>) -> Self {
                    $wrapper {
                        inner: <$typename>::new(buddy),
                        poisoned: AtomicBool::new(false),
                    }
                }

                /// Returns `true` if an earlier operation panicked.
                pub fn is_poisoned(&self) -> bool {
                    self.poisoned.load(Ordering::Acquire)
                }

                /// Unwraps the allocator.
                ///
                /// # Panics
                ///
                /// Panics if the wrapper is poisoned.
                pub fn into_inner(self) -> BuddyAllocator<ORDERS, M, A> {
                    assert!(!self.is_poisoned(), "buddy allocator poisoned by an earlier panic");

                    $into(self.inner)
                }

                /// Calls `f` with exclusive access to the allocator.
                ///
                /// # Panics
                ///
                /// Panics if the wrapper is poisoned. If `f` panics, the wrapper
                /// is poisoned.
                pub fn with_inner<R, F>(&self, f: F) -> R
                where
                    F: FnOnce(&mut BuddyAllocator<ORDERS, M, A>) -> R,
                {
                    let mut inner = $lock(&self.inner);
                    assert!(!self.is_poisoned(), "buddy allocator poisoned by an earlier panic");

                    let armed = PoisonOnUnwind(&self.poisoned);
                    let res = f(&mut *inner);
                    mem::forget(armed);

                    res
                }

                /// See [`BuddyAllocator::allocate`].
                pub fn allocate(&self, order: usize) -> Result<M::Page, AllocError> {
                    self.with_inner(|buddy| buddy.allocate(order))
                }

                /// See [`BuddyAllocator::deallocate`].
                pub fn deallocate(&self, page: M::Page, order: usize) {
                    self.with_inner(|buddy| buddy.deallocate(page, order))
                }

                /// See [`BuddyAllocator::reserve`].
                pub fn reserve(&self, page: M::Page) -> Result<(), ReserveError> {
                    self.with_inner(|buddy| buddy.reserve(page))
                }

                /// See [`BuddyAllocator::reserve_block`].
                pub fn reserve_block(&self, page: M::Page, order: usize) -> Result<(), ReserveError> {
                    self.with_inner(|buddy| buddy.reserve_block(page, order))
                }

                /// See [`BuddyAllocator::dump_state`].
                pub fn dump_state(&self) {
                    self.with_inner(|buddy| buddy.dump_state())
                }
            }

            $(#[$attr])*
            impl<const ORDERS: usize, M: PageMap, A: BackingAllocator> fmt::Debug
                for $wrapper<ORDERS, M, A>
            {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.debug_struct(stringify!($wrapper))
                        .field("poisoned", &self.is_poisoned())
                        .finish_non_exhaustive()
                }
            }
        )*
    };
}

/// Poisons the wrapper if dropped during unwinding. Forgotten on success.
struct PoisonOnUnwind<'a>(&'a AtomicBool);

impl Drop for PoisonOnUnwind<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

declare_wrappers! {
    SpinBuddyAllocator uses spin::Mutex<BuddyAllocator<ORDERS, M, A>>,
        via spin::Mutex::lock, into spin::Mutex::into_inner;

    RefCellBuddyAllocator uses RefCell<BuddyAllocator<ORDERS, M, A>>,
        via RefCell::borrow_mut, into RefCell::into_inner;
}

#[cfg(feature = "std")]
declare_wrappers! {
    #[cfg_attr(docs_rs, doc(cfg(feature = "std")))]
    MutexBuddyAllocator uses Mutex<BuddyAllocator<ORDERS, M, A>>,
        via lock_mutex, into unwrap_mutex;
}

#[cfg(feature = "std")]
fn lock_mutex<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("buddy allocator mutex poisoned")
}

#[cfg(feature = "std")]
fn unwrap_mutex<T>(mutex: Mutex<T>) -> T {
    mutex.into_inner().expect("buddy allocator mutex poisoned")
}
