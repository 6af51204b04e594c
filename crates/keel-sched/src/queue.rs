//! Bounded lock-free MPMC ring queue.
//!
//! Four 32-bit positions describe the ring, packed pairwise into two
//! 64-bit atomics so that each side loads its own pair at once:
//!
//! - `front_head`: next slot a producer will reserve;
//! - `back_head`: bound of committed writes (consumers may read up to it);
//! - `front_tail`: one before the next slot a consumer will reserve;
//! - `back_tail`: bound of committed reads (producers may write up to it).
//!
//! An operation reserves its slot with one CAS, touches the buffer, then
//! commits by advancing the opposite pair's low half in FIFO order. A
//! producer observing `front_head == back_tail` is either truly full or
//! racing a consumer that has reserved but not committed; comparing
//! against `front_tail` disambiguates (symmetrically for consumers). The
//! queue never blocks: it reports [`QueueError::Full`] or
//! [`QueueError::Empty`] and lets the caller retry.
//!
//! The buffer holds `capacity + 1` slots; the read side trails one slot
//! behind, so the initial state is `front_tail = back_tail = capacity`
//! with heads at zero, making slot 0 the first written and the first
//! read.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use keel_core::QueueError;

#[inline]
fn hi(v: u64) -> u32 {
    (v >> 32) as u32
}

#[inline]
fn lo(v: u64) -> u32 {
    v as u32
}

#[inline]
fn pack(hi: u32, lo: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Fixed-capacity multi-producer multi-consumer queue of `Copy` values.
pub struct BoundedQueue<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// `(front_head << 32) | back_tail`
    front_head_back_tail: AtomicU64,
    /// `(front_tail << 32) | back_head`
    front_tail_back_head: AtomicU64,
}

// SAFETY: slots are handed between threads through the reserve/commit
// protocol; a slot is touched only by the thread that reserved it, and
// commits publish the contents with release/acquire pairs.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T: Copy> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or does not fit the 32-bit position
    /// arithmetic.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        assert!(capacity < u32::MAX as usize, "queue capacity exceeds index range");
        let n = capacity + 1;
        let buffer = (0..n)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            front_head_back_tail: AtomicU64::new(pack(0, (n - 1) as u32)),
            front_tail_back_head: AtomicU64::new(pack((n - 1) as u32, 0)),
        }
    }

    /// Maximum number of values the queue can hold.
    pub fn capacity(&self) -> usize {
        self.buffer.len() - 1
    }

    /// Committed values currently in the queue. Racy snapshot; exact only
    /// while no operation is in flight.
    pub fn len(&self) -> usize {
        let n = self.buffer.len() as u32;
        let ftbh = self.front_tail_back_head.load(Ordering::Acquire);
        let readable_from = (hi(ftbh) + 1) % n;
        ((lo(ftbh) + n - readable_from) % n) as usize
    }

    /// Whether the queue holds no committed values (racy snapshot).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a value, failing with [`QueueError::Full`] when `capacity`
    /// values are already in the queue.
    pub fn enqueue(&self, value: T) -> Result<(), QueueError> {
        let n = self.buffer.len() as u32;
        loop {
            let fhbt = self.front_head_back_tail.load(Ordering::Acquire);
            let head = hi(fhbt);
            let tail = lo(fhbt);
            if head == tail {
                // Full, or transiently full while a consumer commits.
                let ftbh = self.front_tail_back_head.load(Ordering::Acquire);
                if hi(ftbh) != head {
                    // A read is in flight; its commit will free a slot.
                    std::hint::spin_loop();
                    continue;
                }
                return Err(QueueError::Full);
            }
            let next = (head + 1) % n;
            if self
                .front_head_back_tail
                .compare_exchange(fhbt, pack(next, tail), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // Slot `head` is exclusively ours until the commit below.
            // SAFETY: the reserve CAS guarantees no other producer holds
            // this slot, and consumers cannot pass back_head.
            unsafe { (*self.buffer[head as usize].get()).write(value) };
            fence(Ordering::Release);
            // Commit in FIFO order: advance back_head from our slot once
            // every earlier writer has committed. The CAS loop preserves
            // the high half, which consumers move concurrently.
            loop {
                let cur = self.front_tail_back_head.load(Ordering::Acquire);
                if lo(cur) == head
                    && self
                        .front_tail_back_head
                        .compare_exchange(
                            cur,
                            pack(hi(cur), next),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    return Ok(());
                }
                std::hint::spin_loop();
            }
        }
    }

    /// Dequeue a value, failing with [`QueueError::Empty`] when no
    /// committed value is available.
    pub fn dequeue(&self) -> Result<T, QueueError> {
        let n = self.buffer.len() as u32;
        loop {
            let ftbh = self.front_tail_back_head.load(Ordering::Acquire);
            let tail = hi(ftbh);
            let bound = lo(ftbh);
            let slot = (tail + 1) % n;
            if slot == bound {
                // Empty, or transiently empty while a producer commits.
                let fhbt = self.front_head_back_tail.load(Ordering::Acquire);
                if hi(fhbt) != slot {
                    std::hint::spin_loop();
                    continue;
                }
                return Err(QueueError::Empty);
            }
            if self
                .front_tail_back_head
                .compare_exchange(ftbh, pack(slot, bound), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            fence(Ordering::Acquire);
            // SAFETY: the reserve CAS grants exclusive read access to this
            // slot; the producer's commit happened-before via the acquire
            // load of back_head.
            let value = unsafe { (*self.buffer[slot as usize].get()).assume_init_read() };
            // Commit: advance back_tail from our reservation point once
            // earlier readers have committed, freeing the slot for
            // producers.
            loop {
                let cur = self.front_head_back_tail.load(Ordering::Acquire);
                if lo(cur) == tail
                    && self
                        .front_head_back_tail
                        .compare_exchange(
                            cur,
                            pack(hi(cur), slot),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    return Ok(value);
                }
                std::hint::spin_loop();
            }
        }
    }

    /// Single-threaded enqueue. The `&mut` receiver rules out concurrent
    /// access, so no CAS loops or fences are needed.
    pub fn enqueue_unsync(&mut self, value: T) -> Result<(), QueueError> {
        let n = self.buffer.len() as u32;
        let fhbt = *self.front_head_back_tail.get_mut();
        let (head, tail) = (hi(fhbt), lo(fhbt));
        if head == tail {
            return Err(QueueError::Full);
        }
        let next = (head + 1) % n;
        self.buffer[head as usize].get_mut().write(value);
        *self.front_head_back_tail.get_mut() = pack(next, tail);
        let ftbh = self.front_tail_back_head.get_mut();
        *ftbh = pack(hi(*ftbh), next);
        Ok(())
    }

    /// Single-threaded dequeue; see [`enqueue_unsync`](Self::enqueue_unsync).
    pub fn dequeue_unsync(&mut self) -> Result<T, QueueError> {
        let n = self.buffer.len() as u32;
        let ftbh = *self.front_tail_back_head.get_mut();
        let (tail, bound) = (hi(ftbh), lo(ftbh));
        let slot = (tail + 1) % n;
        if slot == bound {
            return Err(QueueError::Empty);
        }
        // SAFETY: slot is within the committed range, written by a prior
        // enqueue.
        let value = unsafe { self.buffer[slot as usize].get_mut().assume_init_read() };
        *self.front_tail_back_head.get_mut() = pack(slot, bound);
        let fhbt = self.front_head_back_tail.get_mut();
        *fhbt = pack(hi(*fhbt), slot);
        Ok(value)
    }
}
