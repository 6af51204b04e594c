//! Property tests for the block heap: alignment, content integrity, and
//! free-count conservation over random allocate/free interleavings.

use proptest::collection::vec;
use proptest::prelude::*;

use keel_alloc::BlockHeap;

#[derive(Clone, Debug)]
struct Request {
    size: usize,
    align_log2: u32,
}

fn request() -> impl Strategy<Value = Request> {
    // Sizes spanning every class plus the direct regime; alignments up
    // to 4 KiB.
    (1usize..40_000, 0u32..12).prop_map(|(size, align_log2)| Request { size, align_log2 })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn returned_pointers_are_aligned(reqs in vec(request(), 1..40)) {
        let mut heap = BlockHeap::new();
        let mut live = Vec::new();
        for r in &reqs {
            let align = 1usize << r.align_log2;
            let p = heap.alloc(r.size, align).unwrap();
            prop_assert_eq!(p.as_ptr() as usize & (align - 1), 0);
            live.push((p, r.size, align));
        }
        for (p, size, align) in live {
            heap.free(p, size, align);
        }
    }

    #[test]
    fn contents_survive_neighbour_churn(
        reqs in vec(request(), 2..30),
        drops in vec(any::<prop::sample::Index>(), 1..10),
    ) {
        let mut heap = BlockHeap::new();
        let mut live = Vec::new();
        for (i, r) in reqs.iter().enumerate() {
            let align = 1usize << r.align_log2;
            let p = heap.alloc(r.size, align).unwrap();
            let stamp = (i % 251) as u8 + 1;
            unsafe { p.as_ptr().write_bytes(stamp, r.size) };
            live.push((p, r.size, align, stamp));
        }
        for d in &drops {
            if live.is_empty() {
                break;
            }
            let (p, size, align, stamp) = live.swap_remove(d.index(live.len()));
            unsafe {
                prop_assert_eq!(*p.as_ptr(), stamp);
                prop_assert_eq!(*p.as_ptr().add(size - 1), stamp);
            }
            heap.free(p, size, align);
        }
        // Survivors are intact after the churn.
        for (p, size, _, stamp) in &live {
            unsafe {
                prop_assert_eq!(*p.as_ptr(), *stamp);
                prop_assert_eq!(*p.as_ptr().add(size - 1), *stamp);
            }
        }
        for (p, size, align, _) in live {
            heap.free(p, size, align);
        }
    }

    #[test]
    fn alloc_free_counts_balance(reqs in vec(request(), 1..50)) {
        let mut heap = BlockHeap::new();
        let mut live = Vec::new();
        for r in &reqs {
            let align = 1usize << r.align_log2;
            live.push((heap.alloc(r.size, align).unwrap(), r.size, align));
        }
        for (p, size, align) in live {
            heap.free(p, size, align);
        }
        let stats = heap.stats();
        prop_assert_eq!(stats.pooled_allocs, stats.pooled_frees);
        prop_assert_eq!(stats.direct_allocs, stats.direct_frees);
    }

    #[test]
    fn realloc_preserves_prefix(
        initial in 1usize..5_000,
        resized in 1usize..50_000,
    ) {
        let mut heap = BlockHeap::new();
        let p = heap.alloc(initial, 8).unwrap();
        unsafe {
            for i in 0..initial.min(64) {
                p.as_ptr().add(i).write((i % 256) as u8);
            }
        }
        let q = heap.realloc(p, initial, 8, resized, 8).unwrap();
        let check = initial.min(resized).min(64);
        unsafe {
            for i in 0..check {
                prop_assert_eq!(*q.as_ptr().add(i), (i % 256) as u8);
            }
        }
        heap.free(q, resized, 8);
    }
}
