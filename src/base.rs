//! The seam between the heap and the operating system's virtual-memory
//! interface.

#[cfg(unix)]
mod mmap;

use std::ptr::NonNull;

#[cfg(unix)]
pub use self::mmap::Mmap;

/// A source of raw virtual-address ranges.
///
/// The heap acquires address space in large reservations and trims them
/// down to naturally aligned segments, so implementations must tolerate
/// releasing *parts* of an earlier reservation: any page-aligned
/// subrange of a reserved range is a valid argument to
/// [`release`](BaseAlloc::release), and the remaining pieces stay
/// usable.
///
/// # Safety
///
/// `reserve` must return a page-aligned range of at least `size` bytes
/// that is readable, writable, and unused by anything else; the range
/// must be zero-filled if `IS_ZEROED` is true.
pub unsafe trait BaseAlloc: Clone {
    /// Whether freshly reserved memory is guaranteed zero-filled.
    const IS_ZEROED: bool;

    type Error: std::fmt::Debug + std::fmt::Display;

    /// Reserves `size` bytes of committed address space. `size` is a
    /// multiple of the system page size.
    fn reserve(&self, size: usize) -> Result<NonNull<u8>, Self::Error>;

    /// Releases `[ptr, ptr + size)` back to the system.
    ///
    /// # Safety
    ///
    /// The range must be a page-aligned subrange of a reservation from
    /// this allocator, with no live references into it, and must not be
    /// used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// Failures surfaced by the slow allocation paths.
#[derive(Debug)]
pub enum Error<B: BaseAlloc> {
    /// The base allocator could not reserve address space.
    Os(B::Error),
    /// The request size overflows the page arithmetic.
    Overflow,
}

impl<B: BaseAlloc> std::fmt::Display for Error<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Os(err) => write!(f, "base allocator failure: {err}"),
            Error::Overflow => write!(f, "request size overflows page arithmetic"),
        }
    }
}
