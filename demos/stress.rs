//! Randomized multi-thread churn: every thread hammers its own heap
//! across the small/large/huge boundaries, then main releases the
//! leftovers cross-thread through the pending queues.

use std::{ptr::NonNull, thread, time::Instant};

use cuproc::{Heap, Mmap, HUGE_THRESHOLD};
use rand::{rngs::StdRng, Rng, SeedableRng};

const THREADS: usize = 8;
const ROUNDS: usize = 100_000;
const MAX_LIVE: usize = 500;

fn main() {
    let start = Instant::now();
    let heaps: Vec<_> = (0..THREADS).map(|_| Heap::new(Mmap::new())).collect();

    let leftovers: Vec<Vec<usize>> = thread::scope(|scope| {
        let handles: Vec<_> = heaps
            .iter()
            .enumerate()
            .map(|(seed, heap)| scope.spawn(move || churn(seed as u64, heap)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (heap, blocks) in heaps.iter().zip(leftovers) {
        for addr in blocks {
            // SAFETY: Each leftover is a live allocation of `heap`,
            // released exactly once, from a thread that never ran it.
            unsafe { heap.push_pending_free(NonNull::new(addr as *mut u8).unwrap()) };
        }
        heap.flush_pending();

        let stat = heap.stat();
        assert_eq!(stat.pending_frees, 0);
        assert_eq!(stat.partial_slabs, 0);
        assert_eq!(stat.huge_segments, 0);
        assert_eq!(stat.free_runs, stat.active_segments);
        println!(
            "heap recovered: {} segment(s), {} free pages",
            stat.active_segments, stat.free_run_pages
        );
    }

    println!("{THREADS} threads x {ROUNDS} rounds in {:?}", start.elapsed());
}

fn churn(seed: u64, heap: &Heap<Mmap>) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<(usize, usize)> = Vec::new();

    for _ in 0..ROUNDS {
        if live.len() > MAX_LIVE || (!live.is_empty() && rng.gen_bool(0.5)) {
            let (addr, size) = live.swap_remove(rng.gen_range(0..live.len()));
            let ptr = NonNull::new(addr as *mut u8).unwrap();
            // SAFETY: Tracked as live; released exactly once.
            unsafe {
                assert_eq!(ptr.as_ptr().add(size - 1).read(), 0xBB);
                if size > 1 {
                    assert_eq!(ptr.as_ptr().read(), 0xAA);
                }
                if rng.gen_bool(0.05) {
                    heap.push_pending_free(ptr);
                } else {
                    heap.free(ptr);
                }
            }
        } else {
            let size = match rng.gen_range(0..100u32) {
                0..=79 => rng.gen_range(1..=1024),
                80..=94 => rng.gen_range(1025..=256 * 1024),
                95..=98 => rng.gen_range(256 * 1024 + 1..=HUGE_THRESHOLD),
                _ => rng.gen_range(HUGE_THRESHOLD + 1..HUGE_THRESHOLD + 32 * 4096),
            };
            let ptr = heap.allocate(size).expect("out of memory");
            // SAFETY: The allocation spans `size` writable bytes.
            unsafe {
                ptr.as_ptr().write(0xAA);
                ptr.as_ptr().add(size - 1).write(0xBB);
            }
            live.push((ptr.as_ptr() as usize, size));
        }
    }

    live.into_iter().map(|(addr, _)| addr).collect()
}
