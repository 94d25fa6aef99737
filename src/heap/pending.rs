//! The cross-thread pending-free queue: a Treiber stack whose nodes are
//! the freed blocks themselves.
//!
//! Any thread may push without touching the heap lock; the owning
//! thread drains the whole stack in one exchange and routes each block
//! through the ordinary free path. ABA cannot occur: a block address
//! reappears on the stack only after the owner has processed and
//! reallocated it, which is serialised by the heap lock.

use std::{
    ptr,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering::*},
};

use crate::track;

#[repr(C)]
struct Node {
    next: *mut Node,
}

/// Lock-free single-linked stack of blocks awaiting their owner.
pub(crate) struct PendingFrees {
    head: AtomicPtr<Node>,
    /// Informational; readers must tolerate slack.
    count: AtomicUsize,
}

impl PendingFrees {
    pub(crate) const fn new() -> Self {
        PendingFrees {
            head: AtomicPtr::new(ptr::null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Relaxed).is_null()
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Relaxed)
    }

    /// Pushes a block. Callable from any thread; never blocks.
    ///
    /// # Safety
    ///
    /// `block` must be a block owned by this queue's heap, at least
    /// pointer-sized, unreferenced, and not already pending.
    pub(crate) unsafe fn push(&self, block: NonNull<u8>) {
        let node = block.cast::<Node>();
        let mut cur = self.head.load(Relaxed);
        loop {
            track::undefined(block, std::mem::size_of::<*mut Node>());
            // SAFETY: The block is unreferenced and big enough to hold
            // the link word.
            unsafe { ptr::addr_of_mut!((*node.as_ptr()).next).write(cur) };
            track::no_access(block, std::mem::size_of::<*mut Node>());
            match self
                .head
                .compare_exchange_weak(cur, node.as_ptr(), AcqRel, Acquire)
            {
                Ok(_) => break,
                Err(head) => cur = head,
            }
        }
        self.count.fetch_add(1, Relaxed);
    }

    /// Detaches the whole stack in one exchange.
    ///
    /// # Safety
    ///
    /// Only the owning heap may call this, and every yielded block must
    /// be released before the blocks can be reused.
    pub(crate) unsafe fn take(&self) -> Drain {
        let head = self.head.swap(ptr::null_mut(), AcqRel);
        if !head.is_null() {
            self.count.store(0, Relaxed);
        }
        Drain { cur: head }
    }
}

/// Iterator over a detached pending list. The link word of each node is
/// read *before* the node is yielded, so the caller may clobber the
/// block immediately.
pub(crate) struct Drain {
    cur: *mut Node,
}

impl Iterator for Drain {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = NonNull::new(self.cur)?;
        track::defined(node.cast(), std::mem::size_of::<*mut Node>());
        // SAFETY: Nodes on a detached list are live blocks whose link
        // word was written by `push`.
        self.cur = unsafe { ptr::addr_of!((*node.as_ptr()).next).read() };
        track::no_access(node.cast(), std::mem::size_of::<*mut Node>());
        Some(node.cast())
    }
}
