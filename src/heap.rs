//! The per-thread heap: the orchestrator that routes requests across
//! the small, large, and huge paths and unifies `free` through the
//! page-descriptor reverse lookup.
//!
//! One mutex guards all in-heap state; the only operation that bypasses
//! it is [`Heap::push_pending_free`], which goes through the lock-free
//! [pending queue](pending) instead.

mod pending;

use std::{
    num::NonZeroUsize,
    ptr,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Mutex, MutexGuard, PoisonError,
    },
};

use array_macro::array;

use self::pending::PendingFrees;
use crate::{
    base::{BaseAlloc, Error},
    config::{
        size_classes, SizeClass, MAX_SIZE_CLASSES, MAX_SMALL_OBJECT_SIZE, PAGES_PER_SEGMENT,
        PAGE_SIZE, SEGMENT_SIZE,
    },
    list::RawList,
    segment::{PageStatus, Segment, METADATA_PAGES, USABLE_PAGES},
    slab::{LargeSlab, SmallSlab, LARGE_HEADER_SIZE},
    track,
};

/// The largest request the large path serves; anything bigger gets a
/// dedicated segment. Sized so a maximal large run plus its header is
/// guaranteed to fit into a standard segment's usable region.
pub const HUGE_THRESHOLD: usize = (PAGES_PER_SEGMENT
    - METADATA_PAGES
    - (LARGE_HEADER_SIZE + PAGE_SIZE - 1) / PAGE_SIZE)
    * PAGE_SIZE
    - LARGE_HEADER_SIZE;

fn log_error<B: BaseAlloc>(err: Error<B>) {
    #[cfg(feature = "error-log")]
    log::error!("cuproc: {err}");
    #[cfg(not(feature = "error-log"))]
    let _ = err;
}

/// A self-contained heap instance. Intended use is one heap per thread:
/// the owning thread calls [`allocate`](Heap::allocate) and
/// [`free`](Heap::free), other threads hand blocks back through
/// [`push_pending_free`](Heap::push_pending_free).
pub struct Heap<B: BaseAlloc> {
    base: B,
    /// Stable identity stamped into segment headers; survives moves of
    /// the `Heap` value, unlike its address.
    id: NonZeroUsize,
    pending: PendingFrees,
    inner: Mutex<HeapInner>,
}

// SAFETY: Every raw pointer behind the mutex is reachable only while
// the lock is held; the pending queue is atomic; segment descriptor 0
// and the owner tag are write-once before publication.
unsafe impl<B: BaseAlloc + Send> Send for Heap<B> {}
unsafe impl<B: BaseAlloc + Sync> Sync for Heap<B> {}

struct HeapInner {
    /// Per-class lists of partial slabs (`0 < free_count < capacity`).
    bins: [RawList<SmallSlab>; MAX_SIZE_CLASSES],
    /// Free runs keyed by page count: bucket `k` holds runs of exactly
    /// `k + 1` pages.
    free_runs: [RawList<LargeSlab>; PAGES_PER_SEGMENT],
    active: RawList<Segment>,
    huge: RawList<Segment>,
}

/// A point-in-time census of a heap, taken under its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub active_segments: usize,
    pub huge_segments: usize,
    pub partial_slabs: usize,
    pub free_runs: usize,
    pub free_run_pages: usize,
    pub pending_frees: usize,
}

impl<B: BaseAlloc> Heap<B> {
    pub fn new(base: B) -> Self {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
        let id = NonZeroUsize::new(NEXT_ID.fetch_add(1, Relaxed)).expect("heap id overflow");
        Heap {
            base,
            id,
            pending: PendingFrees::new(),
            inner: Mutex::new(HeapInner {
                bins: array![_ => RawList::new(); MAX_SIZE_CLASSES],
                free_runs: array![_ => RawList::new(); PAGES_PER_SEGMENT],
                active: RawList::new(),
                huge: RawList::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapInner> {
        // Poisoning could only come from the fatal corruption asserts;
        // observers (teardown, stats) still need the state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owner_tag(&self) -> *const () {
        self.id.get() as *const ()
    }

    /// Allocates `size` bytes, aligned to at least 8.
    ///
    /// Returns `None` for `size == 0`, when the base allocator is out
    /// of address space, or when `size` overflows the page arithmetic.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let mut inner = self.lock();
        if !self.pending.is_empty() {
            // SAFETY: Guaranteed by `push_pending_free`'s contract.
            unsafe { inner.drain_pending(&self.base, &self.pending) };
        }

        let result = if size > HUGE_THRESHOLD {
            inner.allocate_huge(&self.base, self.owner_tag(), size)
        } else if size > MAX_SMALL_OBJECT_SIZE {
            inner.allocate_large(&self.base, self.owner_tag(), size)
        } else {
            inner.allocate_small(&self.base, self.owner_tag(), size)
        };
        drop(inner);

        match result {
            Ok(ptr) => {
                debug_assert_eq!(ptr.as_ptr() as usize % 8, 0);
                track::allocate(ptr, size, false);
                Some(ptr)
            }
            Err(err) => {
                log_error(err);
                None
            }
        }
    }

    /// Releases an allocation.
    ///
    /// Stale pointers whose descriptor dispatch lands on a free or
    /// metadata page are ignored; freeing a slab block twice aborts.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `self.allocate` and not freed
    /// since, and no reference into the allocation may be used
    /// afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        track::deallocate(ptr);
        let seg = Segment::from_ptr(ptr);
        // SAFETY: `ptr` is from this heap, so `seg` is live and its
        // descriptor 0 is write-once.
        if unsafe { Segment::first_status(seg) } == PageStatus::HugeSlab {
            let mut inner = self.lock();
            // SAFETY: A huge segment stays on the huge list until its
            // sole allocation (this one) is freed.
            unsafe {
                debug_assert_eq!(Segment::owner(seg), self.owner_tag());
                inner.huge.remove(seg);
                Segment::destroy(&self.base, seg);
            }
            return;
        }

        let mut inner = self.lock();
        // SAFETY: `ptr` is an unreferenced allocation of this heap.
        unsafe {
            debug_assert_eq!(Segment::owner(seg), self.owner_tag());
            inner.free_local(ptr);
        }
    }

    /// Hands a block back from any thread. The actual release happens
    /// at the owner's next [`allocate`](Heap::allocate) or
    /// [`flush_pending`](Heap::flush_pending); this call never takes
    /// the heap lock.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Heap::free).
    pub unsafe fn push_pending_free(&self, ptr: NonNull<u8>) {
        track::deallocate(ptr);
        // SAFETY: An unreferenced allocation is at least 8 bytes and
        // owned by this heap per the contract.
        unsafe { self.pending.push(ptr) };
    }

    /// Drains the pending-free queue now.
    pub fn flush_pending(&self) {
        if self.pending.is_empty() {
            return;
        }
        let mut inner = self.lock();
        // SAFETY: Guaranteed by `push_pending_free`'s contract.
        unsafe { inner.drain_pending(&self.base, &self.pending) };
    }

    /// Takes a census of the heap's segments, slabs, and free runs.
    pub fn stat(&self) -> Stat {
        let inner = self.lock();
        let mut free_runs = 0;
        let mut free_run_pages = 0;
        for (index, bucket) in inner.free_runs.iter().enumerate() {
            free_runs += bucket.len();
            free_run_pages += (index + 1) * bucket.len();
        }
        Stat {
            active_segments: inner.active.len(),
            huge_segments: inner.huge.len(),
            partial_slabs: inner.bins.iter().map(RawList::len).sum(),
            free_runs,
            free_run_pages,
            pending_frees: self.pending.count(),
        }
    }
}

impl<B: BaseAlloc> Drop for Heap<B> {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.pending.is_empty() {
            // SAFETY: Guaranteed by `push_pending_free`'s contract;
            // there is no later drain to pick these up.
            unsafe { inner.drain_pending(&self.base, &self.pending) };
        }
        // SAFETY: Dropping the heap invalidates every outstanding
        // allocation; all segments go back to the base allocator.
        unsafe {
            while let Some(seg) = inner.active.pop_front() {
                Segment::destroy(&self.base, seg);
            }
            while let Some(seg) = inner.huge.pop_front() {
                Segment::destroy(&self.base, seg);
            }
        }
    }
}

impl HeapInner {
    /// Routes one detached pending block through the same dispatch as
    /// [`Heap::free`].
    ///
    /// # Safety
    ///
    /// The queue's blocks must satisfy [`Heap::free`]'s contract.
    unsafe fn drain_pending<B: BaseAlloc>(&mut self, base: &B, pending: &PendingFrees) {
        // SAFETY: We hold the heap lock; blocks are valid per contract.
        unsafe {
            for block in pending.take() {
                let seg = Segment::from_ptr(block);
                if Segment::first_status(seg) == PageStatus::HugeSlab {
                    self.huge.remove(seg);
                    Segment::destroy(base, seg);
                } else {
                    self.free_local(block);
                }
            }
        }
    }

    fn allocate_small<B: BaseAlloc>(
        &mut self,
        base: &B,
        owner: *const (),
        size: usize,
    ) -> Result<NonNull<u8>, Error<B>> {
        let classes = size_classes();
        // SAFETY: The caller routed `size <= MAX_SMALL_OBJECT_SIZE`.
        let class_index = unsafe { classes.index_of(size).unwrap_unchecked() };
        let class = classes.class(class_index);

        let slab = match self.bins[class_index].head() {
            Some(slab) => slab,
            None => {
                let slab = self.new_small_slab(base, owner, class_index, class)?;
                // SAFETY: A fresh slab is unlinked and fully free.
                unsafe { self.bins[class_index].push_front(slab) };
                slab
            }
        };

        // SAFETY: Bin members are partial, so the head has a free
        // block; the heap lock makes the access exclusive.
        unsafe {
            let block = SmallSlab::allocate_block(slab, class);
            if SmallSlab::is_full(slab) {
                self.bins[class_index].remove(slab);
            }
            Ok(block)
        }
    }

    fn new_small_slab<B: BaseAlloc>(
        &mut self,
        base: &B,
        owner: *const (),
        class_index: usize,
        class: &SizeClass,
    ) -> Result<NonNull<SmallSlab>, Error<B>> {
        let run = self.acquire_pages(base, owner, class.slab_pages)?;
        // SAFETY: `acquire_pages` hands over an exclusively held run of
        // `class.slab_pages` pages inside a live segment.
        unsafe {
            let slab = SmallSlab::init(run, class_index as u16, class);
            let seg = Segment::from_ptr(run);
            let first = Segment::page_index_of(seg, run);
            for index in first..first + class.slab_pages {
                (*Segment::descriptor(seg, index).as_ptr())
                    .set(PageStatus::SmallSlab, slab.as_ptr().cast());
            }
            Ok(slab)
        }
    }

    fn allocate_large<B: BaseAlloc>(
        &mut self,
        base: &B,
        owner: *const (),
        size: usize,
    ) -> Result<NonNull<u8>, Error<B>> {
        let total = size.checked_add(LARGE_HEADER_SIZE).ok_or(Error::Overflow)?;
        let pages = total.div_ceil(PAGE_SIZE);
        debug_assert!(pages <= USABLE_PAGES);

        let run = self.acquire_pages(base, owner, pages)?;
        // SAFETY: Same exclusivity as in `new_small_slab`.
        unsafe {
            let slab = LargeSlab::init(run, pages);
            let seg = Segment::from_ptr(run);
            let first = Segment::page_index_of(seg, run);
            for index in first..first + pages {
                (*Segment::descriptor(seg, index).as_ptr())
                    .set(PageStatus::LargeSlab, slab.as_ptr().cast());
            }
            Ok(run.add(LARGE_HEADER_SIZE))
        }
    }

    fn allocate_huge<B: BaseAlloc>(
        &mut self,
        base: &B,
        owner: *const (),
        size: usize,
    ) -> Result<NonNull<u8>, Error<B>> {
        let payload = size.checked_add(PAGE_SIZE - 1).ok_or(Error::Overflow)? & !(PAGE_SIZE - 1);
        let total = (METADATA_PAGES * PAGE_SIZE)
            .checked_add(payload)
            .ok_or(Error::Overflow)?;

        let seg = Segment::create(base, total)?;
        // SAFETY: The segment is fresh and unpublished until we return.
        unsafe {
            Segment::set_owner(seg, owner);
            (*Segment::descriptor(seg, 0).as_ptr()).set(PageStatus::HugeSlab, ptr::null_mut());
            self.huge.push_front(seg);
            Ok(Segment::page_addr(seg, METADATA_PAGES))
        }
    }

    /// Takes `pages` contiguous pages from the free-run pool, creating
    /// a segment when the pool is dry. The pages' descriptors still
    /// read `Free`; the caller rewrites all of them.
    fn acquire_pages<B: BaseAlloc>(
        &mut self,
        base: &B,
        owner: *const (),
        pages: usize,
    ) -> Result<NonNull<u8>, Error<B>> {
        debug_assert!(pages >= 1 && pages <= USABLE_PAGES);
        loop {
            // SAFETY: Bucket members are live free-run headers.
            if let Some(run) = unsafe { self.free_runs[pages - 1].pop_front() } {
                return Ok(run.cast());
            }

            // First fit, ascending: the closest larger run splits, and
            // its tail goes back to the pool.
            for index in pages..PAGES_PER_SEGMENT {
                // SAFETY: Same as above.
                let Some(run) = (unsafe { self.free_runs[index].pop_front() }) else {
                    continue;
                };
                let found = index + 1;
                // SAFETY: The run spans `found` pages; the tail starts
                // inside it and stays within the same segment.
                unsafe {
                    let tail = run.cast::<u8>().add(pages * PAGE_SIZE);
                    self.format_free_run(tail, found - pages);
                }
                return Ok(run.cast());
            }

            let seg = Segment::create(base, SEGMENT_SIZE)?;
            // SAFETY: The segment is fresh; its whole post-metadata
            // region becomes one free run, then the loop retries.
            unsafe {
                Segment::set_owner(seg, owner);
                self.active.push_front(seg);
                let first = Segment::page_addr(seg, METADATA_PAGES);
                self.format_free_run(first, USABLE_PAGES);
            }
        }
    }

    /// Formats `[head, head + pages * PAGE_SIZE)` as one free run and
    /// prepends it to its bucket (LIFO, so a just-freed run is the next
    /// one handed out).
    ///
    /// # Safety
    ///
    /// The range must be an exclusively held page run inside a live
    /// standard segment, past the metadata prefix.
    unsafe fn format_free_run(&mut self, head: NonNull<u8>, pages: usize) {
        // SAFETY: Forwarded contract.
        unsafe {
            let run = LargeSlab::init(head, pages);
            let seg = Segment::from_ptr(head);
            let first = Segment::page_index_of(seg, head);
            debug_assert!(first >= METADATA_PAGES);
            debug_assert!(first + pages <= PAGES_PER_SEGMENT);
            for index in first..first + pages {
                (*Segment::descriptor(seg, index).as_ptr())
                    .set(PageStatus::Free, run.as_ptr().cast());
            }
            self.free_runs[pages - 1].push_front(run);
        }
    }

    /// Returns a run to the pool, merging with whichever neighbours are
    /// free. Only the two adjacent pages are inspected: their
    /// descriptors name their run heads, and the heads know their
    /// lengths.
    ///
    /// # Safety
    ///
    /// `[head, head + pages * PAGE_SIZE)` must be an exclusively held
    /// run inside a live standard segment, past the metadata prefix.
    unsafe fn release_pages(&mut self, head: NonNull<u8>, pages: usize) {
        let mut head = head;
        let mut pages = pages;
        let seg = Segment::from_ptr(head);
        // SAFETY: The run and any free neighbours live in `seg`, and
        // free-run headers are live while their descriptors say `Free`.
        unsafe {
            let first = Segment::page_index_of(seg, head);
            debug_assert!(first >= METADATA_PAGES);

            let after = first + pages;
            if after < PAGES_PER_SEGMENT {
                let desc = Segment::descriptor(seg, after).as_ptr();
                if (*desc).status == PageStatus::Free {
                    let neighbour = NonNull::new_unchecked((*desc).back_ptr).cast::<LargeSlab>();
                    let neighbour_pages = LargeSlab::pages(neighbour);
                    self.free_runs[neighbour_pages - 1].remove(neighbour);
                    pages += neighbour_pages;
                }
            }

            if first > METADATA_PAGES {
                let desc = Segment::descriptor(seg, first - 1).as_ptr();
                if (*desc).status == PageStatus::Free {
                    let neighbour = NonNull::new_unchecked((*desc).back_ptr).cast::<LargeSlab>();
                    let neighbour_pages = LargeSlab::pages(neighbour);
                    self.free_runs[neighbour_pages - 1].remove(neighbour);
                    pages += neighbour_pages;
                    head = neighbour.cast();
                }
            }

            self.format_free_run(head, pages);
        }
    }

    /// The unified free path for small and large allocations: find the
    /// page's run head through its descriptor, dispatch on the head's
    /// status.
    ///
    /// # Safety
    ///
    /// `ptr` must be an unreferenced allocation of this heap (or a
    /// tolerated stale pointer per [`Heap::free`]'s docs), and the heap
    /// lock must be held.
    unsafe fn free_local(&mut self, ptr: NonNull<u8>) {
        let seg = Segment::from_ptr(ptr);
        // SAFETY: The pointer's segment is live and owned by this heap.
        unsafe {
            let desc = Segment::descriptor_of(seg, ptr).as_ptr();
            let Some(head) = NonNull::new((*desc).back_ptr) else {
                // never part of any run; nothing to release
                return;
            };
            let head = head.cast::<u8>();
            let head_desc = Segment::descriptor_of(seg, head).as_ptr();
            match (*head_desc).status {
                PageStatus::LargeSlab => {
                    let run = head.cast::<LargeSlab>();
                    self.release_pages(head, LargeSlab::pages(run));
                }
                PageStatus::SmallSlab => {
                    let slab = head.cast::<SmallSlab>();
                    let classes = size_classes();
                    let class_index = SmallSlab::class_id(slab);
                    let class = classes.class(class_index);

                    let was_full = SmallSlab::is_full(slab);
                    SmallSlab::free_block(slab, ptr, class);
                    if SmallSlab::is_empty(slab, class) {
                        if !was_full {
                            self.bins[class_index].remove(slab);
                        }
                        self.release_pages(head, class.slab_pages);
                    } else if was_full {
                        self.bins[class_index].push_front(slab);
                    }
                }
                // a stale or misrouted pointer: the page is free or
                // metadata, so there is nothing coherent to release
                PageStatus::Free | PageStatus::Metadata | PageStatus::HugeSlab => {}
            }
        }
    }
}

#[cfg(test)]
impl<B: BaseAlloc> Heap<B> {
    fn bucket_len(&self, pages: usize) -> usize {
        self.lock().free_runs[pages - 1].len()
    }

    fn bucket_head_addr(&self, pages: usize) -> Option<usize> {
        self.lock().free_runs[pages - 1]
            .head()
            .map(|run| run.as_ptr() as usize)
    }

    fn page_status_of(&self, ptr: NonNull<u8>) -> PageStatus {
        let _guard = self.lock();
        let seg = Segment::from_ptr(ptr);
        // SAFETY: Tests only pass live allocations of this heap.
        unsafe { (*Segment::descriptor_of(seg, ptr).as_ptr()).status }
    }

    fn run_head_of(&self, ptr: NonNull<u8>) -> usize {
        let _guard = self.lock();
        let seg = Segment::from_ptr(ptr);
        // SAFETY: Tests only pass live allocations of this heap.
        unsafe { (*Segment::descriptor_of(seg, ptr).as_ptr()).back_ptr as usize }
    }

    fn segment_first_status(&self, ptr: NonNull<u8>) -> PageStatus {
        let _guard = self.lock();
        // SAFETY: Tests only pass live allocations of this heap.
        unsafe { Segment::first_status(Segment::from_ptr(ptr)) }
    }

    /// Cross-checks every documented structural invariant: descriptor
    /// partition and back-pointer consistency, bitmap accounting, list
    /// memberships, and the absence of adjacent free runs.
    fn assert_invariants(&self) {
        use std::collections::HashMap;

        let inner = self.lock();
        let classes = size_classes();

        // SAFETY: All headers reachable from the lists and descriptor
        // tables are live while the lock is held.
        unsafe {
            let mut pooled_runs: HashMap<usize, usize> = HashMap::new();
            for (index, bucket) in inner.free_runs.iter().enumerate() {
                for run in bucket.iter() {
                    assert_eq!(LargeSlab::pages(run), index + 1, "run in the wrong bucket");
                    let dup = pooled_runs.insert(run.as_ptr() as usize, index + 1);
                    assert!(dup.is_none(), "run on two buckets");
                }
            }

            let mut partial_slabs: HashMap<usize, usize> = HashMap::new();
            for (class_index, bin) in inner.bins.iter().enumerate() {
                for slab in bin.iter() {
                    assert_eq!(SmallSlab::class_id(slab), class_index);
                    let free = SmallSlab::free_count(slab);
                    let capacity = classes.class(class_index).capacity;
                    assert!(free > 0 && free < capacity, "non-partial slab on a bin");
                    partial_slabs.insert(slab.as_ptr() as usize, class_index);
                }
            }

            let mut seen_runs = 0;
            let mut seen_partial = 0;
            for seg in inner.active.iter() {
                assert_eq!(seg.as_ptr() as usize & (SEGMENT_SIZE - 1), 0);
                assert_eq!(Segment::total_size(seg), SEGMENT_SIZE);

                for index in 0..METADATA_PAGES {
                    let desc = Segment::descriptor(seg, index).as_ptr();
                    assert_eq!((*desc).status, PageStatus::Metadata);
                    assert_eq!((*desc).back_ptr, seg.as_ptr().cast());
                }

                let mut index = METADATA_PAGES;
                let mut prev_was_free = false;
                while index < PAGES_PER_SEGMENT {
                    let head_addr = Segment::page_addr(seg, index);
                    let desc = Segment::descriptor(seg, index).as_ptr();
                    let status = (*desc).status;
                    assert_eq!(
                        (*desc).back_ptr as usize, head_addr.as_ptr() as usize,
                        "page {index} is not a run head"
                    );

                    let run_pages = match status {
                        PageStatus::Free => {
                            assert!(!prev_was_free, "adjacent free runs at page {index}");
                            let run = head_addr.cast::<LargeSlab>();
                            let pages = LargeSlab::pages(run);
                            assert_eq!(
                                pooled_runs.get(&(run.as_ptr() as usize)),
                                Some(&pages),
                                "free run missing from its bucket"
                            );
                            seen_runs += 1;
                            pages
                        }
                        PageStatus::LargeSlab => {
                            let run = head_addr.cast::<LargeSlab>();
                            LargeSlab::pages(run)
                        }
                        PageStatus::SmallSlab => {
                            let slab = head_addr.cast::<SmallSlab>();
                            let class = classes.class(SmallSlab::class_id(slab));
                            let free = SmallSlab::free_count(slab);
                            assert_eq!(
                                free,
                                SmallSlab::bitmap_popcount(slab, class),
                                "slab counter disagrees with its bitmap"
                            );
                            let listed = partial_slabs.contains_key(&(slab.as_ptr() as usize));
                            assert_eq!(
                                listed,
                                free > 0 && free < class.capacity,
                                "slab list membership does not match its state"
                            );
                            if listed {
                                seen_partial += 1;
                            }
                            class.slab_pages
                        }
                        status => panic!("unexpected {status:?} at page {index}"),
                    };
                    assert!(index + run_pages <= PAGES_PER_SEGMENT);
                    for offset in 1..run_pages {
                        let desc = Segment::descriptor(seg, index + offset).as_ptr();
                        assert_eq!((*desc).status, status);
                        assert_eq!((*desc).back_ptr as usize, head_addr.as_ptr() as usize);
                    }
                    prev_was_free = status == PageStatus::Free;
                    index += run_pages;
                }
                assert_eq!(index, PAGES_PER_SEGMENT, "descriptor runs do not partition");
            }
            assert_eq!(seen_runs, pooled_runs.len(), "bucket holds a run no segment knows");
            assert_eq!(seen_partial, partial_slabs.len(), "bin holds an orphaned slab");

            for seg in inner.huge.iter() {
                assert_eq!(seg.as_ptr() as usize & (SEGMENT_SIZE - 1), 0);
                assert_eq!(Segment::first_status(seg), PageStatus::HugeSlab);
                assert!(Segment::total_size(seg) >= (METADATA_PAGES + 1) * PAGE_SIZE);
            }
        }
    }
}
