//! A per-thread, segment-based memory heap.
//!
//! Each [`Heap`] owns naturally aligned virtual-memory segments carved
//! into 4 KiB pages. Small requests are served from bitmap slabs shared
//! per size class, large requests from a coalescing free-list of page
//! runs, and oversized requests get a dedicated segment. A
//! page-descriptor table at every segment base makes `free` a pure
//! pointer computation: mask the address to find the segment, index the
//! descriptor, follow its back pointer to the owning header.
//!
//! Heaps are self-contained; the intended pattern is one heap per
//! thread. Other threads hand blocks back through the lock-free
//! [`Heap::push_pending_free`] queue, which the owner drains on its
//! next allocation.
//!
//! ```
//! use cuproc::{Heap, Mmap};
//!
//! let heap = Heap::new(Mmap::new());
//! let ptr = heap.allocate(64).expect("out of memory");
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xAB, 64);
//!     assert_eq!(ptr.as_ptr().add(63).read(), 0xAB);
//!     heap.free(ptr);
//! }
//! ```

#![warn(unsafe_op_in_unsafe_fn)]

pub mod base;
pub mod config;
pub mod heap;
mod list;
mod segment;
mod slab;
mod track;

#[cfg(unix)]
pub use self::base::Mmap;
pub use self::{
    base::{BaseAlloc, Error},
    heap::{Heap, Stat, HUGE_THRESHOLD},
};

#[cfg(test)]
mod tests {
    use crate::{Heap, Mmap, HUGE_THRESHOLD};

    #[test]
    fn basic() {
        let heap = Heap::new(Mmap::new());
        let values = [1u32, 2, 3, 4, 5, 6, 7, 8];
        let ptr = heap.allocate(std::mem::size_of_val(&values)).unwrap();
        // SAFETY: The allocation holds eight aligned `u32`s.
        unsafe {
            let ints = ptr.as_ptr().cast::<u32>();
            for (i, v) in values.iter().enumerate() {
                ints.add(i).write(*v);
            }
            let sum: u32 = (0..values.len()).map(|i| ints.add(i).read()).sum();
            assert_eq!(sum, 36);
            heap.free(ptr);
        }
    }

    #[test]
    fn spans_pages() {
        let heap = Heap::new(Mmap::new());
        let size = 33667;
        let ptr = heap.allocate(size).unwrap();
        // SAFETY: The allocation spans `size` writable bytes.
        unsafe {
            ptr.as_ptr().write_bytes(0, size);
            ptr.as_ptr().add(12345).write(123);
            assert_eq!(ptr.as_ptr().add(12345).read(), 123);
            assert_eq!(ptr.as_ptr().add(12344).read(), 0);
            heap.free(ptr);
        }
    }

    #[test]
    fn huge() {
        let heap = Heap::new(Mmap::new());
        let size = HUGE_THRESHOLD + 5 * 4096;
        let ptr = heap.allocate(size).unwrap();
        // SAFETY: The allocation spans `size` writable bytes.
        unsafe {
            ptr.as_ptr().write(0x11);
            ptr.as_ptr().add(size / 2).write(0x22);
            ptr.as_ptr().add(size - 1).write(0x33);
            assert_eq!(ptr.as_ptr().read(), 0x11);
            assert_eq!(ptr.as_ptr().add(size / 2).read(), 0x22);
            assert_eq!(ptr.as_ptr().add(size - 1).read(), 0x33);
            heap.free(ptr);
        }
    }

    #[test]
    fn heaps_are_independent() {
        let a = Heap::new(Mmap::new());
        let b = Heap::new(Mmap::new());
        let pa = a.allocate(128).unwrap();
        let pb = b.allocate(128).unwrap();
        assert_ne!(
            pa.as_ptr() as usize & !(crate::config::SEGMENT_SIZE - 1),
            pb.as_ptr() as usize & !(crate::config::SEGMENT_SIZE - 1),
            "heaps share a segment"
        );
        // SAFETY: Each block goes back to its own heap.
        unsafe {
            a.free(pa);
            b.free(pb);
        }
    }
}
