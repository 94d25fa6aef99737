//! Slab headers: the bitmap-managed small-object slab and the header
//! shared by large runs (allocated or free).
//!
//! Both headers live at the first byte of their page run inside a
//! segment, never on the stack, so every operation goes through a raw
//! header pointer. Exclusive access is the caller's obligation, in
//! practice the owning heap's lock.

use std::{mem, ptr, ptr::NonNull};

use crate::{
    config::SizeClass,
    list::{Linked, RawLink},
};

/// Header of a large page run. Present whether the run is allocated or
/// free: the list link is live only while the run sits in a free-list
/// bucket, and the caller-visible address of a large allocation is
/// `header + LARGE_HEADER_SIZE`.
#[repr(C)]
pub struct LargeSlab {
    link: RawLink<LargeSlab>,
    pages: u16,
    _reserved: u16,
}

/// Bytes between a large run's base and its user payload.
pub const LARGE_HEADER_SIZE: usize = mem::size_of::<LargeSlab>();

const _: () = assert!(LARGE_HEADER_SIZE == 24);

impl Linked for LargeSlab {
    unsafe fn link(this: NonNull<Self>) -> NonNull<RawLink<Self>> {
        // SAFETY: Projection within a live header.
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*this.as_ptr()).link)) }
    }
}

impl LargeSlab {
    /// Writes a fresh header at the base of a page run.
    ///
    /// # Safety
    ///
    /// `at` must be the writable, exclusively held base of a run of
    /// `pages` pages.
    pub(crate) unsafe fn init(at: NonNull<u8>, pages: usize) -> NonNull<LargeSlab> {
        let this = at.cast::<LargeSlab>();
        debug_assert!(pages > 0);
        debug_assert!(u16::try_from(pages).is_ok());
        // SAFETY: Exclusive, writable per the contract.
        unsafe {
            let p = this.as_ptr();
            ptr::addr_of_mut!((*p).link).write(RawLink::new());
            ptr::addr_of_mut!((*p).pages).write(pages as u16);
            ptr::addr_of_mut!((*p)._reserved).write(0);
        }
        this
    }

    /// # Safety
    ///
    /// `this` must point to a live large-run header.
    #[inline]
    pub(crate) unsafe fn pages(this: NonNull<Self>) -> usize {
        // SAFETY: Live header per the contract.
        unsafe { ptr::addr_of!((*this.as_ptr()).pages).read() as usize }
    }
}

/// Header of a bitmap slab. The bitmap words follow immediately (set
/// bit = free block), then padding up to the class's `metadata_size`,
/// then `capacity` equal-sized blocks.
#[repr(C)]
pub struct SmallSlab {
    link: RawLink<SmallSlab>,
    free_count: u16,
    class_id: u16,
}

/// Offset of the bitmap from the slab base; the size-class solver uses
/// it to derive each class's metadata footprint.
pub const SMALL_HEADER_BASE: usize = mem::size_of::<SmallSlab>();

const _: () = assert!(SMALL_HEADER_BASE == 24);

impl Linked for SmallSlab {
    unsafe fn link(this: NonNull<Self>) -> NonNull<RawLink<Self>> {
        // SAFETY: Projection within a live header.
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*this.as_ptr()).link)) }
    }
}

/// Find-first-set over one bitmap word; compiles to a single bit-scan
/// on every mainstream target.
#[inline]
pub(crate) fn first_set_bit(word: u64) -> u32 {
    debug_assert_ne!(word, 0);
    word.trailing_zeros()
}

impl SmallSlab {
    /// Formats a page run as a slab with every block free.
    ///
    /// # Safety
    ///
    /// `at` must be the writable, exclusively held base of a run of
    /// `class.slab_pages` pages.
    pub(crate) unsafe fn init(
        at: NonNull<u8>,
        class_id: u16,
        class: &SizeClass,
    ) -> NonNull<SmallSlab> {
        let this = at.cast::<SmallSlab>();
        debug_assert!(u16::try_from(class.capacity).is_ok());
        // SAFETY: Exclusive, writable per the contract; the bitmap
        // words lie within the run's metadata prefix.
        unsafe {
            let p = this.as_ptr();
            ptr::addr_of_mut!((*p).link).write(RawLink::new());
            ptr::addr_of_mut!((*p).free_count).write(class.capacity as u16);
            ptr::addr_of_mut!((*p).class_id).write(class_id);

            let words = Self::bitmap(this);
            let word_count = class.capacity.div_ceil(64);
            for index in 0..word_count {
                words.add(index).write(u64::MAX);
            }
            let excess = class.capacity % 64;
            if excess != 0 {
                words.add(word_count - 1).write((1u64 << excess) - 1);
            }
        }
        this
    }

    /// # Safety
    ///
    /// `this` must point to a live slab header.
    #[inline]
    unsafe fn bitmap(this: NonNull<Self>) -> *mut u64 {
        // SAFETY: The bitmap starts right past the fixed fields.
        unsafe { this.as_ptr().cast::<u8>().add(SMALL_HEADER_BASE).cast() }
    }

    /// # Safety
    ///
    /// `this` must point to a live slab header.
    #[inline]
    pub(crate) unsafe fn free_count(this: NonNull<Self>) -> usize {
        // SAFETY: Live header per the contract.
        unsafe { ptr::addr_of!((*this.as_ptr()).free_count).read() as usize }
    }

    /// # Safety
    ///
    /// `this` must point to a live slab header.
    #[inline]
    pub(crate) unsafe fn class_id(this: NonNull<Self>) -> usize {
        // SAFETY: Live header per the contract.
        unsafe { ptr::addr_of!((*this.as_ptr()).class_id).read() as usize }
    }

    /// # Safety
    ///
    /// `this` must point to a live slab header of `class`.
    #[inline]
    pub(crate) unsafe fn is_full(this: NonNull<Self>) -> bool {
        // SAFETY: Forwarded contract.
        unsafe { Self::free_count(this) == 0 }
    }

    /// # Safety
    ///
    /// `this` must point to a live slab header of `class`.
    #[inline]
    pub(crate) unsafe fn is_empty(this: NonNull<Self>, class: &SizeClass) -> bool {
        // SAFETY: Forwarded contract.
        unsafe { Self::free_count(this) == class.capacity }
    }

    /// Claims the lowest-indexed free block. Lowest-first keeps reuse
    /// close to recently touched memory.
    ///
    /// # Safety
    ///
    /// `this` must point to an exclusively held slab header of `class`
    /// with `free_count > 0`.
    pub(crate) unsafe fn allocate_block(this: NonNull<Self>, class: &SizeClass) -> NonNull<u8> {
        // SAFETY: Exclusive access per the contract; the bitmap and
        // counter stay consistent because both are updated below.
        unsafe {
            debug_assert!(Self::free_count(this) > 0);
            let words = Self::bitmap(this);
            let word_count = class.capacity.div_ceil(64);
            for index in 0..word_count {
                let word = words.add(index).read();
                if word == 0 {
                    continue;
                }
                let bit = first_set_bit(word);
                let block_index = index * 64 + bit as usize;
                debug_assert!(block_index < class.capacity);

                words.add(index).write(word & !(1u64 << bit));
                let p = this.as_ptr();
                ptr::addr_of_mut!((*p).free_count).write((*p).free_count - 1);
                return Self::block_addr(this, class, block_index);
            }
            unreachable!("slab has free blocks but an empty bitmap");
        }
    }

    /// Returns a block to the bitmap.
    ///
    /// `ptr` must map onto an allocated block; a set bit (double free)
    /// or a pointer off the block grid is heap corruption and aborts.
    ///
    /// # Safety
    ///
    /// `this` must point to an exclusively held slab header of `class`,
    /// and `ptr` must lie within its page run.
    pub(crate) unsafe fn free_block(this: NonNull<Self>, ptr: NonNull<u8>, class: &SizeClass) {
        let blocks = this.as_ptr() as usize + class.metadata_size;
        let addr = ptr.as_ptr() as usize;
        assert!(addr >= blocks, "freed pointer lands in slab metadata");
        let offset = addr - blocks;
        assert!(offset % class.block_size == 0, "freed pointer is not on a block boundary");
        let block_index = offset / class.block_size;
        assert!(block_index < class.capacity, "freed pointer is past the slab's last block");

        // SAFETY: Exclusive access per the contract.
        unsafe {
            let word = Self::bitmap(this).add(block_index / 64);
            let mask = 1u64 << (block_index % 64);
            assert!(word.read() & mask == 0, "double free of a slab block");
            word.write(word.read() | mask);
            let p = this.as_ptr();
            ptr::addr_of_mut!((*p).free_count).write((*p).free_count + 1);
        }
    }

    /// Recounts the bitmap; used by the invariant checks to validate
    /// `free_count`.
    ///
    /// # Safety
    ///
    /// `this` must point to a live slab header of `class`.
    #[cfg(test)]
    pub(crate) unsafe fn bitmap_popcount(this: NonNull<Self>, class: &SizeClass) -> usize {
        // SAFETY: Live header per the contract.
        unsafe {
            let words = Self::bitmap(this);
            (0..class.capacity.div_ceil(64))
                .map(|index| words.add(index).read().count_ones() as usize)
                .sum()
        }
    }

    /// # Safety
    ///
    /// `this` must point to a live slab header of `class` and
    /// `block_index < class.capacity`.
    #[inline]
    pub(crate) unsafe fn block_addr(
        this: NonNull<Self>,
        class: &SizeClass,
        block_index: usize,
    ) -> NonNull<u8> {
        // SAFETY: Blocks lie within the slab's page run.
        unsafe {
            this.cast::<u8>()
                .add(class.metadata_size + block_index * class.block_size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{size_classes, PAGE_SIZE};
    use std::alloc::{alloc, dealloc, Layout};

    fn first_set_bit_portable(word: u64) -> u32 {
        let mut bit = 0;
        while (word >> bit) & 1 == 0 {
            bit += 1;
        }
        bit
    }

    #[test]
    fn bit_scan_matches_portable_fallback() {
        let samples = [
            1u64,
            2,
            3,
            0x8000_0000_0000_0000,
            0xFFFF_FFFF_FFFF_FFFF,
            0xA5A5_0000_0000_0001,
            1 << 63 | 1 << 17,
            0xF0,
        ];
        for word in samples {
            assert_eq!(first_set_bit(word), first_set_bit_portable(word));
        }
        let mut word = 0x9E37_79B9_7F4A_7C15u64;
        for _ in 0..64 {
            if word != 0 {
                assert_eq!(first_set_bit(word), first_set_bit_portable(word));
            }
            word = word.wrapping_mul(0x2545_F491_4F6C_DD1D).rotate_left(7);
        }
    }

    struct RawRun {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl RawRun {
        fn for_class(class: &crate::config::SizeClass) -> Self {
            let layout =
                Layout::from_size_align(class.slab_pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: `layout` has nonzero size.
            let ptr = NonNull::new(unsafe { alloc(layout) }).unwrap();
            RawRun { ptr, layout }
        }
    }

    impl Drop for RawRun {
        fn drop(&mut self) {
            // SAFETY: Allocated with the same layout in `for_class`.
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    #[test]
    fn init_accounts_every_block_free() {
        let table = size_classes();
        for index in [0, 7, table.len() / 2, table.len() - 1] {
            let class = table.class(index);
            let run = RawRun::for_class(class);
            // SAFETY: The run is exclusively owned.
            unsafe {
                let slab = SmallSlab::init(run.ptr, index as u16, class);
                assert_eq!(SmallSlab::free_count(slab), class.capacity);
                assert_eq!(SmallSlab::class_id(slab), index);
                assert!(SmallSlab::is_empty(slab, class));
                assert!(!SmallSlab::is_full(slab));

                let words = SmallSlab::bitmap(slab);
                let mut bits = 0u32;
                for w in 0..class.capacity.div_ceil(64) {
                    bits += words.add(w).read().count_ones();
                }
                assert_eq!(bits as usize, class.capacity);
            }
        }
    }

    #[test]
    fn allocation_is_lowest_index_first() {
        let table = size_classes();
        let class_index = table.index_of(48).unwrap();
        let class = table.class(class_index);
        let run = RawRun::for_class(class);
        // SAFETY: The run is exclusively owned.
        unsafe {
            let slab = SmallSlab::init(run.ptr, class_index as u16, class);
            for expect in 0..class.capacity {
                let block = SmallSlab::allocate_block(slab, class);
                assert_eq!(block, SmallSlab::block_addr(slab, class, expect));
                assert_eq!(block.as_ptr() as usize % 8, 0);
            }
            assert!(SmallSlab::is_full(slab));

            // free a scattered set; reallocation drains it in index order
            for index in [71usize, 3, 29, 5] {
                SmallSlab::free_block(slab, SmallSlab::block_addr(slab, class, index), class);
            }
            for expect in [3usize, 5, 29, 71] {
                let block = SmallSlab::allocate_block(slab, class);
                assert_eq!(block, SmallSlab::block_addr(slab, class, expect));
            }
        }
    }

    #[test]
    fn counter_tracks_the_bitmap() {
        let table = size_classes();
        let class_index = table.index_of(8).unwrap();
        let class = table.class(class_index);
        let run = RawRun::for_class(class);
        // SAFETY: The run is exclusively owned.
        unsafe {
            let slab = SmallSlab::init(run.ptr, class_index as u16, class);
            let mut held = Vec::new();
            for _ in 0..class.capacity / 2 {
                held.push(SmallSlab::allocate_block(slab, class));
            }
            let popcount = |slab: NonNull<SmallSlab>| {
                let words = SmallSlab::bitmap(slab);
                (0..class.capacity.div_ceil(64))
                    .map(|w| words.add(w).read().count_ones() as usize)
                    .sum::<usize>()
            };
            assert_eq!(SmallSlab::free_count(slab), class.capacity - held.len());
            assert_eq!(popcount(slab), SmallSlab::free_count(slab));

            for block in held.drain(..) {
                SmallSlab::free_block(slab, block, class);
            }
            assert_eq!(popcount(slab), class.capacity);
            assert!(SmallSlab::is_empty(slab, class));
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let table = size_classes();
        let class_index = table.index_of(64).unwrap();
        let class = table.class(class_index);
        let run = RawRun::for_class(class);
        // SAFETY: The run is exclusively owned.
        unsafe {
            let slab = SmallSlab::init(run.ptr, class_index as u16, class);
            let block = SmallSlab::allocate_block(slab, class);
            SmallSlab::free_block(slab, block, class);
            SmallSlab::free_block(slab, block, class);
        }
    }

    #[test]
    #[should_panic(expected = "block boundary")]
    fn misaligned_free_is_fatal() {
        let table = size_classes();
        let class_index = table.index_of(64).unwrap();
        let class = table.class(class_index);
        let run = RawRun::for_class(class);
        // SAFETY: The run is exclusively owned.
        unsafe {
            let slab = SmallSlab::init(run.ptr, class_index as u16, class);
            let block = SmallSlab::allocate_block(slab, class);
            let skewed = NonNull::new_unchecked(block.as_ptr().add(1));
            SmallSlab::free_block(slab, skewed, class);
        }
    }

    #[test]
    fn large_header_round_trips() {
        let layout = Layout::from_size_align(4 * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: `layout` has nonzero size.
        let ptr = NonNull::new(unsafe { alloc(layout) }).unwrap();
        // SAFETY: The run is exclusively owned.
        unsafe {
            let run = LargeSlab::init(ptr, 4);
            assert_eq!(LargeSlab::pages(run), 4);
            assert_eq!(run.cast::<u8>(), ptr);
            dealloc(ptr.as_ptr(), layout);
        }
    }
}
