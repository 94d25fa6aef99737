use std::{io, ptr::NonNull};

use super::BaseAlloc;

/// A base allocator backed by anonymous `mmap`.
#[derive(Debug, Clone, Copy, Default, Hash)]
pub struct Mmap;

impl Mmap {
    pub const fn new() -> Self {
        Mmap
    }
}

// SAFETY: Anonymous private mappings are page-aligned, zero-filled, and
// disjoint from all other live mappings; `munmap` accepts any
// page-aligned subrange.
unsafe impl BaseAlloc for Mmap {
    const IS_ZEROED: bool = true;

    type Error = io::Error;

    fn reserve(&self, size: usize) -> Result<NonNull<u8>, Self::Error> {
        // SAFETY: No pointer arguments; the kernel picks the placement.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(NonNull::new(ptr.cast()).expect("mmap returned the null page"))
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: Per the trait contract the range is a page-aligned
        // subrange of one of our reservations.
        let ret = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
        debug_assert_eq!(ret, 0, "munmap: {}", io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_page_aligned_and_zeroed() {
        let base = Mmap::new();
        let size = 16 * 4096;
        let ptr = base.reserve(size).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
        // SAFETY: Freshly reserved and unshared.
        unsafe {
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), size);
            assert!(bytes.iter().all(|&b| b == 0));
            base.release(ptr, size);
        }
    }

    #[test]
    fn partial_release_keeps_the_rest_usable() {
        let base = Mmap::new();
        let size = 8 * 4096;
        let ptr = base.reserve(size).unwrap();
        // SAFETY: Splitting our own fresh reservation page-by-page.
        unsafe {
            base.release(ptr, 4096);
            let tail = NonNull::new_unchecked(ptr.as_ptr().add(7 * 4096));
            base.release(tail, 4096);

            let middle = ptr.as_ptr().add(4096);
            middle.write_bytes(0xA5, 6 * 4096);
            assert_eq!(*middle, 0xA5);
            base.release(NonNull::new_unchecked(middle), 6 * 4096);
        }
    }
}
