//! Valgrind client-request shims. With the `track-valgrind` feature the
//! heap reports its blocks to memcheck so the demos can run clean under
//! `--tool=memcheck`; otherwise everything compiles to nothing.

#[cfg(feature = "track-valgrind")]
mod imp {
    use std::ptr::NonNull;

    use crabgrind::memcheck::*;

    pub fn allocate(ptr: NonNull<u8>, size: usize, is_zeroed: bool) {
        alloc::malloc(ptr.as_ptr().cast(), size, 0, is_zeroed)
    }

    pub fn deallocate(ptr: NonNull<u8>) {
        alloc::free(ptr.as_ptr().cast(), 0)
    }

    pub fn undefined(ptr: NonNull<u8>, size: usize) {
        let _ = mark_mem(ptr.as_ptr().cast(), size, MemState::Undefined);
    }

    pub fn defined(ptr: NonNull<u8>, size: usize) {
        let _ = mark_mem(ptr.as_ptr().cast(), size, MemState::Defined);
    }

    pub fn no_access(ptr: NonNull<u8>, size: usize) {
        let _ = mark_mem(ptr.as_ptr().cast(), size, MemState::NoAccess);
    }
}

#[cfg(not(feature = "track-valgrind"))]
mod imp {
    use std::ptr::NonNull;

    pub fn allocate(ptr: NonNull<u8>, size: usize, is_zeroed: bool) {
        let _ = (ptr, size, is_zeroed);
    }

    pub fn deallocate(ptr: NonNull<u8>) {
        let _ = ptr;
    }

    pub fn undefined(ptr: NonNull<u8>, size: usize) {
        let _ = (ptr, size);
    }

    pub fn defined(ptr: NonNull<u8>, size: usize) {
        let _ = (ptr, size);
    }

    pub fn no_access(ptr: NonNull<u8>, size: usize) {
        let _ = (ptr, size);
    }
}

pub(crate) use self::imp::*;
