//! Polyfills for unstable features.
//!
//! The implementations in this module follow the standard library's
//! strict-provenance API, backed by `sptr` on stable.

// #![feature(strict_provenance)]

use core::{num::NonZeroUsize, ptr::NonNull};

use sptr::Strict;

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
    }

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized,
    {
        // SAFETY: The result of `ptr::from::with_addr` is non-null because `addr` is guaranteed to be non-zero.
        unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get()) as *mut _) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_addr_preserves_address() {
        let mut values = [0_u64; 4];
        let base = NonNull::from(&mut values).cast::<u64>();
        let third = NonZeroUsize::new(base.addr().get() + 2 * core::mem::size_of::<u64>()).unwrap();

        let ptr = base.with_addr(third);
        assert_eq!(ptr.addr(), third);
        assert_eq!(ptr.as_ptr(), values.as_mut_ptr().wrapping_add(2));
    }
}
