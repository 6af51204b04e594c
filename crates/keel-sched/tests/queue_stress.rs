//! Cross-thread stress tests for the bounded MPMC queue: every value
//! enqueued is dequeued exactly once, and totals balance.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use keel_sched::BoundedQueue;

#[test]
fn three_producers_three_consumers_conserve_sum() {
    const PER_PRODUCER: usize = 5000;
    const PRODUCERS: usize = 3;
    const CONSUMERS: usize = 3;

    let queue = Arc::new(BoundedQueue::new(64));
    let produced_sum = Arc::new(AtomicI64::new(0));
    let consumed_sum = Arc::new(AtomicI64::new(0));
    let consumed_count = Arc::new(AtomicU64::new(0));
    let producers_done = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let produced_sum = Arc::clone(&produced_sum);
            thread::spawn(move || {
                // Cheap deterministic pseudo-random values, distinct per
                // producer.
                let mut state = (p as u32 + 1).wrapping_mul(0x9E37_79B9);
                for i in 0..PER_PRODUCER {
                    state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    let value = (state >> 8) as i32 + i as i32;
                    produced_sum.fetch_add(i64::from(value), Ordering::Relaxed);
                    while queue.enqueue(value).is_err() {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let consumed_sum = Arc::clone(&consumed_sum);
            let consumed_count = Arc::clone(&consumed_count);
            let done = Arc::clone(&producers_done);
            thread::spawn(move || loop {
                match queue.dequeue() {
                    Ok(v) => {
                        consumed_sum.fetch_add(i64::from(v), Ordering::Relaxed);
                        consumed_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        if done.load(Ordering::Acquire) && queue.is_empty() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    producers_done.store(true, Ordering::Release);
    for c in consumers {
        c.join().unwrap();
    }

    assert_eq!(consumed_count.load(Ordering::Relaxed), (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(
        consumed_sum.load(Ordering::Relaxed),
        produced_sum.load(Ordering::Relaxed),
        "every enqueued value must be dequeued exactly once"
    );
    assert!(queue.is_empty());
}

#[test]
fn capacity_is_never_exceeded() {
    // Two producers hammer a tiny queue while one consumer drains
    // slowly; the committed length must never pass the capacity.
    const CAP: usize = 4;
    let queue = Arc::new(BoundedQueue::new(CAP));
    let stop = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..2)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut sent = 0u32;
                while !stop.load(Ordering::Acquire) {
                    if queue.enqueue(sent).is_ok() {
                        sent = sent.wrapping_add(1);
                    }
                    assert!(queue.len() <= CAP);
                }
            })
        })
        .collect();

    let consumer = {
        let queue = Arc::clone(&queue);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut received = 0usize;
            while received < 20_000 {
                if queue.dequeue().is_ok() {
                    received += 1;
                }
            }
            stop.store(true, Ordering::Release);
            // Drain whatever the producers managed to squeeze in.
            while queue.dequeue().is_ok() {}
        })
    };

    for p in producers {
        p.join().unwrap();
    }
    consumer.join().unwrap();
    // Producers may have committed a few final values after the drain.
    assert!(queue.len() <= CAP);
}

#[test]
fn handoff_pairs_preserve_values() {
    // One producer, one consumer, strict FIFO must hold.
    let queue = Arc::new(BoundedQueue::new(8));
    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            for v in 0..10_000u32 {
                while queue.enqueue(v).is_err() {
                    std::hint::spin_loop();
                }
            }
        })
    };
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut expected = 0u32;
            while expected < 10_000 {
                if let Ok(v) = queue.dequeue() {
                    assert_eq!(v, expected, "single-consumer dequeue order must be FIFO");
                    expected += 1;
                }
            }
        })
    };
    producer.join().unwrap();
    consumer.join().unwrap();
}
