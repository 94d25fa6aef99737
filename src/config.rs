//! Compile-time geometry and the process-wide size-class table.
//!
//! The size-class table accepts any monotonically increasing block-size
//! schedule; the one built here mixes growth steps so that small classes
//! stay dense (8-byte steps up to 128 bytes) while large classes stay
//! sparse (16 KiB steps near [`MAX_SMALL_OBJECT_SIZE`]). The table is
//! computed once on first use and immutable afterwards.

use std::sync::OnceLock;

/// The granularity of page-level bookkeeping.
pub const PAGE_SIZE: usize = 4096;

/// The size and alignment of a standard segment. Must be a power of two
/// and a multiple of [`PAGE_SIZE`].
pub const SEGMENT_SIZE: usize = 2 * 1024 * 1024;

/// The number of page descriptors each segment carries.
pub const PAGES_PER_SEGMENT: usize = SEGMENT_SIZE / PAGE_SIZE;

/// The largest request serviced by the bitmap slab path.
pub const MAX_SMALL_OBJECT_SIZE: usize = 256 * 1024;

/// Upper bound on the number of size classes; the lookup table stores
/// class indices as `u8`.
pub const MAX_SIZE_CLASSES: usize = 128;

const _: () = assert!(SEGMENT_SIZE.is_power_of_two());
const _: () = assert!(SEGMENT_SIZE % PAGE_SIZE == 0);
const _: () = assert!(MAX_SMALL_OBJECT_SIZE < SEGMENT_SIZE / 2);

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The geometry of one small-object size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Bytes per user block; a multiple of 8, strictly increasing over
    /// the table.
    pub block_size: usize,
    /// Pages a slab of this class occupies.
    pub slab_pages: usize,
    /// Blocks per slab: the largest count whose bitmap and payload fit
    /// into `slab_pages` pages.
    pub capacity: usize,
    /// Bytes from the slab base to block 0; 8-byte aligned.
    pub metadata_size: usize,
}

/// The frozen size-class table plus its O(1) byte-size lookup.
pub struct SizeClasses {
    classes: Vec<SizeClass>,
    /// `lookup[n]` is the smallest class index whose `block_size >= n`,
    /// for `0 <= n <= MAX_SMALL_OBJECT_SIZE`; `lookup[0] == 0`.
    lookup: Vec<u8>,
}

/// Returns the process-wide size-class table, building it on first use.
pub fn size_classes() -> &'static SizeClasses {
    static TABLE: OnceLock<SizeClasses> = OnceLock::new();
    TABLE.get_or_init(SizeClasses::build)
}

impl SizeClasses {
    fn build() -> Self {
        let schedule = block_size_schedule();
        let classes = schedule
            .into_iter()
            .map(|(block_size, suggested_pages)| solve_class(block_size, suggested_pages))
            .collect::<Vec<_>>();
        assert!(classes.len() <= MAX_SIZE_CLASSES);

        let mut lookup = vec![0u8; MAX_SMALL_OBJECT_SIZE + 1];
        let mut class = 0usize;
        for size in 1..=MAX_SMALL_OBJECT_SIZE {
            if size > classes[class].block_size {
                class += 1;
            }
            lookup[size] = class as u8;
        }

        SizeClasses { classes, lookup }
    }

    /// Maps a request size to its class index, or `None` when the size
    /// is out of the small range.
    #[inline]
    pub fn index_of(&self, size: usize) -> Option<usize> {
        self.lookup.get(size).map(|&class| class as usize)
    }

    #[inline]
    pub fn class(&self, index: usize) -> &SizeClass {
        &self.classes[index]
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SizeClass> {
        self.classes.iter()
    }
}

/// The mixed-step block-size schedule with a suggested slab size per
/// class. Steps widen with magnitude so the worst-case internal
/// fragmentation stays proportional.
fn block_size_schedule() -> Vec<(usize, usize)> {
    let mut schedule = Vec::new();
    let mut block_size = 8usize;
    while block_size <= MAX_SMALL_OBJECT_SIZE {
        let suggested_pages = if block_size <= 1024 {
            16
        } else if block_size <= 64 * 1024 {
            // roughly eight blocks per slab
            (block_size * 8).div_ceil(PAGE_SIZE)
        } else {
            // roughly two blocks per slab
            (block_size * 2).div_ceil(PAGE_SIZE)
        };
        if schedule.last().map_or(true, |&(prev, _)| prev < block_size) {
            schedule.push((block_size, suggested_pages));
        }

        block_size += match block_size {
            ..=127 => 8,
            128..=255 => 16,
            256..=511 => 32,
            512..=1023 => 64,
            1024..=4095 => 256,
            4096..=16383 => 1024,
            16384..=65535 => 4096,
            _ => 16384,
        };
    }
    schedule
}

/// Solves the derived fields of one class: clamp the page count, then
/// take the largest capacity whose metadata prefix and payload fit.
fn solve_class(block_size: usize, suggested_pages: usize) -> SizeClass {
    debug_assert!(block_size % 8 == 0);

    let min_pages = (block_size * 8).div_ceil(PAGE_SIZE);
    let max_pages = PAGES_PER_SEGMENT / 2;
    let slab_pages = suggested_pages.max(min_pages).min(max_pages);

    let slab_bytes = slab_pages * PAGE_SIZE;
    let mut capacity = slab_bytes / block_size;
    let metadata_size = loop {
        assert!(capacity > 0, "size class {block_size} fits no block");
        let bitmap_words = capacity.div_ceil(64);
        let metadata_size = align_up(crate::slab::SMALL_HEADER_BASE + bitmap_words * 8, 8);
        if metadata_size + capacity * block_size <= slab_bytes {
            break metadata_size;
        }
        capacity -= 1;
    };

    SizeClass {
        block_size,
        slab_pages,
        capacity,
        metadata_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_sizes_strictly_increase() {
        let table = size_classes();
        for pair in table.classes.windows(2) {
            assert!(pair[0].block_size < pair[1].block_size);
        }
        assert_eq!(table.classes.first().unwrap().block_size, 8);
        assert_eq!(table.classes.last().unwrap().block_size, MAX_SMALL_OBJECT_SIZE);
    }

    #[test]
    fn lookup_round_trips() {
        let table = size_classes();
        assert_eq!(table.index_of(0), Some(0));
        for size in 1..=MAX_SMALL_OBJECT_SIZE {
            let index = table.index_of(size).unwrap();
            let class = table.class(index);
            assert!(class.block_size >= size, "class {index} too small for {size}");
            if index > 0 {
                assert!(
                    table.class(index - 1).block_size < size,
                    "{size} should map to class {}",
                    index - 1
                );
            }
        }
        assert_eq!(table.index_of(MAX_SMALL_OBJECT_SIZE + 1), None);
        assert_eq!(table.index_of(usize::MAX), None);
    }

    #[test]
    fn lookup_skips_matched_classes() {
        let table = size_classes();
        for (index, class) in table.iter().enumerate().take(table.len() - 1) {
            let next = table.index_of(class.block_size + 1).unwrap();
            assert!(next > index);
        }
    }

    #[test]
    fn geometry_fits_every_class() {
        let table = size_classes();
        assert!(table.len() <= MAX_SIZE_CLASSES);
        for class in table.iter() {
            assert!(class.capacity >= 1);
            assert!(class.slab_pages >= 1);
            assert!(class.slab_pages <= PAGES_PER_SEGMENT / 2);
            assert_eq!(class.metadata_size % 8, 0);

            let bitmap_words = class.capacity.div_ceil(64);
            let prefix = align_up(crate::slab::SMALL_HEADER_BASE + bitmap_words * 8, 8);
            assert_eq!(prefix, class.metadata_size);
            let used = class.metadata_size + class.capacity * class.block_size;
            assert!(used <= class.slab_pages * PAGE_SIZE);
            // one more block must not fit
            let bitmap_words = (class.capacity + 1).div_ceil(64);
            let prefix = align_up(crate::slab::SMALL_HEADER_BASE + bitmap_words * 8, 8);
            assert!(prefix + (class.capacity + 1) * class.block_size > class.slab_pages * PAGE_SIZE);
        }
    }

    #[test]
    fn slabs_hold_a_useful_block_count() {
        let table = size_classes();
        for class in table.iter() {
            if class.block_size <= 1024 {
                assert!(class.capacity >= 8, "dense class {} too sparse", class.block_size);
            }
        }
    }
}
