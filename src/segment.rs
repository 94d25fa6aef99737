//! Naturally aligned virtual-memory segments and their page-descriptor
//! tables.
//!
//! A segment is the unit of acquisition from the base allocator. Its
//! header (owner tag, list link, total size, and one descriptor per
//! page) lives at the segment base, so `ptr & !(SEGMENT_SIZE - 1)`
//! recovers the header from any byte of any allocation the segment
//! serves. That mask is what lets `free` run without a global registry.

use std::{mem, ptr, ptr::NonNull};

use crate::{
    base::{BaseAlloc, Error},
    config::{align_up, PAGES_PER_SEGMENT, PAGE_SIZE, SEGMENT_SIZE},
    list::{Linked, RawLink},
};

/// What a page is currently used for. The discriminant of `Free` is
/// zero so zero-filled reservations start with every page free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageStatus {
    Free = 0,
    Metadata,
    SmallSlab,
    LargeSlab,
    HugeSlab,
}

/// Per-page metadata record.
///
/// `back_ptr` identifies the header that owns the page: the enclosing
/// free run's [`LargeSlab`](crate::slab::LargeSlab) for `Free`, the
/// segment header for `Metadata`, the run-head slab header for
/// `SmallSlab`/`LargeSlab`. For `HugeSlab` only descriptor 0 is
/// meaningful and `back_ptr` is unused.
#[repr(C)]
pub struct PageDescriptor {
    pub(crate) status: PageStatus,
    pub(crate) back_ptr: *mut (),
}

impl PageDescriptor {
    pub(crate) fn set(&mut self, status: PageStatus, back_ptr: *mut ()) {
        self.status = status;
        self.back_ptr = back_ptr;
    }
}

/// The in-memory segment header. Always placed at a `SEGMENT_SIZE`
/// aligned address; the descriptor array covers the first
/// `SEGMENT_SIZE` of address space even when the segment is larger
/// (huge) or smaller (short huge) than that.
#[repr(C)]
pub struct Segment {
    owner: *const (),
    link: RawLink<Segment>,
    total_size: usize,
    descriptors: [PageDescriptor; PAGES_PER_SEGMENT],
}

/// Pages permanently consumed by the segment header.
pub const METADATA_PAGES: usize = (mem::size_of::<Segment>() + PAGE_SIZE - 1) / PAGE_SIZE;

/// Pages of a standard segment available to slabs and runs.
pub const USABLE_PAGES: usize = PAGES_PER_SEGMENT - METADATA_PAGES;

const _: () = assert!(METADATA_PAGES < PAGES_PER_SEGMENT / 2);

impl Linked for Segment {
    unsafe fn link(this: NonNull<Self>) -> NonNull<RawLink<Self>> {
        // SAFETY: Projection within a live header.
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*this.as_ptr()).link)) }
    }
}

impl Segment {
    /// Maps and formats a segment of `total_size` bytes (page-aligned,
    /// at least the header) whose base is aligned to `SEGMENT_SIZE`.
    ///
    /// The base allocator is asked for `total_size + SEGMENT_SIZE -
    /// PAGE_SIZE` bytes so an aligned window is guaranteed; the
    /// misaligned head and tail are released straight back.
    pub(crate) fn create<B: BaseAlloc>(
        base: &B,
        total_size: usize,
    ) -> Result<NonNull<Segment>, Error<B>> {
        debug_assert!(total_size % PAGE_SIZE == 0);
        debug_assert!(total_size >= METADATA_PAGES * PAGE_SIZE);

        let reserve_size = total_size
            .checked_add(SEGMENT_SIZE - PAGE_SIZE)
            .ok_or(Error::Overflow)?;
        let raw = base.reserve(reserve_size).map_err(Error::Os)?;

        let addr = raw.as_ptr() as usize;
        let aligned = align_up(addr, SEGMENT_SIZE);
        let head_trim = aligned - addr;
        let tail_trim = reserve_size - head_trim - total_size;
        // SAFETY: Head, window, and tail partition the fresh
        // reservation at page granularity.
        let seg = unsafe {
            if head_trim > 0 {
                base.release(raw, head_trim);
            }
            let seg = raw.add(head_trim);
            if tail_trim > 0 {
                base.release(seg.add(total_size), tail_trim);
            }
            seg.cast::<Segment>()
        };

        // SAFETY: The aligned window is owned, writable, and large
        // enough for the header; fields are initialised in place (the
        // header never exists on the stack).
        unsafe {
            let p = seg.as_ptr();
            ptr::addr_of_mut!((*p).owner).write(ptr::null());
            ptr::addr_of_mut!((*p).link).write(RawLink::new());
            ptr::addr_of_mut!((*p).total_size).write(total_size);
            if !B::IS_ZEROED {
                for index in 0..PAGES_PER_SEGMENT {
                    ptr::addr_of_mut!((*p).descriptors[index])
                        .write(PageDescriptor { status: PageStatus::Free, back_ptr: ptr::null_mut() });
                }
            }
            for index in 0..METADATA_PAGES {
                ptr::addr_of_mut!((*p).descriptors[index]).write(PageDescriptor {
                    status: PageStatus::Metadata,
                    back_ptr: seg.as_ptr().cast(),
                });
            }
        }
        Ok(seg)
    }

    /// Returns the whole mapping to the base allocator.
    ///
    /// # Safety
    ///
    /// `seg` must have been produced by [`Segment::create`] with the
    /// same base allocator, must be off every list, and no pointer into
    /// it may be used afterwards.
    pub(crate) unsafe fn destroy<B: BaseAlloc>(base: &B, seg: NonNull<Segment>) {
        // SAFETY: `[seg, seg + total_size)` is exactly the window kept
        // by `create`.
        unsafe {
            let total_size = (*seg.as_ptr()).total_size;
            base.release(seg.cast(), total_size);
        }
    }

    /// Recovers the segment header address from any byte the segment's
    /// descriptor table covers.
    #[inline]
    pub(crate) fn from_ptr(ptr: NonNull<u8>) -> NonNull<Segment> {
        // SAFETY: Masking an address inside a segment cannot reach
        // zero; segment bases are above `SEGMENT_SIZE`.
        ptr.map_addr(|addr| unsafe {
            std::num::NonZeroUsize::new_unchecked(addr.get() & !(SEGMENT_SIZE - 1))
        })
        .cast()
    }

    /// The descriptor index of `ptr`, which must lie within the
    /// segment's descriptor-covered prefix.
    #[inline]
    pub(crate) fn page_index_of(seg: NonNull<Segment>, ptr: NonNull<u8>) -> usize {
        let offset = ptr.as_ptr() as usize - seg.as_ptr() as usize;
        debug_assert!(offset < SEGMENT_SIZE);
        offset / PAGE_SIZE
    }

    /// # Safety
    ///
    /// `seg` must be a live segment and `index < PAGES_PER_SEGMENT`.
    #[inline]
    pub(crate) unsafe fn descriptor(seg: NonNull<Segment>, index: usize) -> NonNull<PageDescriptor> {
        debug_assert!(index < PAGES_PER_SEGMENT);
        // SAFETY: In-bounds projection within a live header.
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*seg.as_ptr()).descriptors[index])) }
    }

    /// Descriptor lookup by pointer; no bounds check beyond the debug
    /// assertion in [`Segment::page_index_of`].
    ///
    /// # Safety
    ///
    /// `seg` must be a live segment and `ptr` must lie within its
    /// descriptor-covered prefix.
    #[inline]
    pub(crate) unsafe fn descriptor_of(
        seg: NonNull<Segment>,
        ptr: NonNull<u8>,
    ) -> NonNull<PageDescriptor> {
        // SAFETY: Forwarded contract.
        unsafe { Self::descriptor(seg, Self::page_index_of(seg, ptr)) }
    }

    /// The address of page `index`.
    ///
    /// # Safety
    ///
    /// `seg` must be a live segment and page `index` must be within its
    /// mapping.
    #[inline]
    pub(crate) unsafe fn page_addr(seg: NonNull<Segment>, index: usize) -> NonNull<u8> {
        // SAFETY: Stays within the mapping per the contract.
        unsafe { seg.cast::<u8>().add(index * PAGE_SIZE) }
    }

    /// Reads the status of descriptor 0.
    ///
    /// For a huge segment this is `HugeSlab`, written once before the
    /// segment is published and never changed, so the read is safe from
    /// any thread that legitimately holds a pointer into the segment.
    #[inline]
    pub(crate) unsafe fn first_status(seg: NonNull<Segment>) -> PageStatus {
        // SAFETY: Descriptor 0 is write-once after publication.
        unsafe { ptr::addr_of!((*seg.as_ptr()).descriptors[0].status).read() }
    }

    /// # Safety
    ///
    /// `seg` must be a live segment.
    pub(crate) unsafe fn owner(seg: NonNull<Segment>) -> *const () {
        // SAFETY: Live header per the contract.
        unsafe { ptr::addr_of!((*seg.as_ptr()).owner).read() }
    }

    /// # Safety
    ///
    /// `seg` must be a live segment not yet visible to other threads.
    pub(crate) unsafe fn set_owner(seg: NonNull<Segment>, owner: *const ()) {
        // SAFETY: Live, unpublished header per the contract.
        unsafe { ptr::addr_of_mut!((*seg.as_ptr()).owner).write(owner) };
    }

    /// # Safety
    ///
    /// `seg` must be a live segment.
    pub(crate) unsafe fn total_size(seg: NonNull<Segment>) -> usize {
        // SAFETY: Live header per the contract.
        unsafe { ptr::addr_of!((*seg.as_ptr()).total_size).read() }
    }
}
