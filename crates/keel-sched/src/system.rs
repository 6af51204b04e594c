//! The job system: dependency DAGs over generation-tagged job slots.
//!
//! A fixed pool of cache-line-sized job slots cycles through a free
//! queue and a ready queue (both [`BoundedQueue`]s). Publication pins a job with a
//! `+1` dependency so it cannot become ready mid-registration, registers
//! it as a permit on each dependency, then releases the pin. Workers
//! drain the ready queue; when a job finishes, its permit list is
//! snapshotted under the slot's spin bit, the slot is recycled with its
//! generation advanced, and each successor's dependency counter is
//! decremented. The first successor that becomes ready is run inline by
//! the same worker, the rest go back through the ready queue.
//!
//! # Per-slot state machine
//!
//! `Free → NotStarted` on the free-queue dequeue at publication;
//! `NotStarted → WaitingForChildren` when the body begins;
//! `WaitingForChildren → Free` when the dependency counter drains after
//! the body has returned (children pin their parent, so it outlives
//! them). Transitions to and from `Free` are serialised by the spin bit
//! plus the free-queue FIFO.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use smallvec::SmallVec;

use keel_alloc::BlockHeap;
use keel_core::{Generation, JobId, SchedError, SlotIndex};

use crate::config::{ConfigError, SchedConfig};
use crate::metrics::{Counters, SchedMetrics};
use crate::queue::BoundedQueue;
use crate::slot::{
    ExternalParam, JobSlot, ParamKind, PermitList, RawJobFn, SlotState, INLINE_PARAM_BYTES,
    NO_PERMIT,
};

/// Lifecycle of the whole system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum SystemState {
    /// No workers; scheduling allowed, the scheduling thread drains via
    /// `flush`/`wait`.
    Idle = 0,
    Running = 1,
    ShuttingDown = 2,
}

/// Shared core of the job system; workers hold an `Arc` of this.
struct Inner {
    slots: Box<[JobSlot]>,
    free: BoundedQueue<u16>,
    ready: BoundedQueue<u16>,
    state: AtomicU8,
    /// Published jobs not yet finalised (excludes permit expansions).
    live: AtomicUsize,
    /// Backing storage for parameters too large for a slot. The heap is
    /// single-threaded by contract, so it sits behind a lock here.
    heap: Mutex<BlockHeap>,
    counters: Counters,
    config: SchedConfig,
}

// Compile-time assertion: the shared core must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Inner>();
};

/// Outcome of registering a permit on a dependency.
enum AddPermit {
    Added,
    AlreadyDone,
}

/// The work-stealing job scheduler.
///
/// Owns the worker threads; the shared core lives behind an `Arc` the
/// workers clone. Dropping the system shuts it down.
pub struct JobSystem {
    inner: Arc<Inner>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// Handle passed to every job body, for spawning children and
/// identifying the running job.
pub struct JobContext<'a> {
    inner: &'a Inner,
    id: JobId,
}

impl JobSystem {
    /// Create a job system with its own default [`BlockHeap`] for
    /// external parameters.
    pub fn new(config: SchedConfig) -> Result<Self, ConfigError> {
        Self::with_heap(config, BlockHeap::new())
    }

    /// Create a job system backed by a caller-configured heap.
    pub fn with_heap(config: SchedConfig, heap: BlockHeap) -> Result<Self, ConfigError> {
        config.validate()?;
        let n = config.num_slots;
        let slots = (0..n).map(|_| JobSlot::new()).collect::<Vec<_>>().into_boxed_slice();
        let mut free = BoundedQueue::new(n);
        for short in 0..n as u16 {
            free.enqueue_unsync(short).expect("free queue sized to the pool");
        }
        let ready = BoundedQueue::new(n);
        Ok(Self {
            inner: Arc::new(Inner {
                slots,
                free,
                ready,
                state: AtomicU8::new(SystemState::Idle as u8),
                live: AtomicUsize::new(0),
                heap: Mutex::new(heap),
                counters: Counters::default(),
                config,
            }),
            workers: Vec::new(),
        })
    }

    /// Spawn the worker threads (count per the config). Idempotent while
    /// running.
    pub fn startup(&mut self) {
        if self.inner.system_state() == SystemState::Running {
            return;
        }
        self.inner.state.store(SystemState::Running as u8, Ordering::Release);
        let count = self.inner.config.resolved_worker_count();
        for i in 0..count {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(format!("keel-worker-{i}"))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn worker thread");
            self.workers.push(handle);
        }
    }

    /// Schedule a job with no dependencies.
    ///
    /// The parameter travels by value; blobs up to 40 bytes (at 8-byte
    /// alignment) live in the job slot, larger ones in a heap buffer
    /// freed when the job finishes.
    pub fn schedule<P, F>(&self, param: P, func: F) -> Result<JobId, SchedError>
    where
        P: Send + 'static,
        F: Fn(&JobContext<'_>, &mut P) + Send + 'static,
    {
        self.inner.publish(param, func, &[], None)
    }

    /// Schedule a job that runs only after every `deps` entry has
    /// finished. Already-finished and [`JobId::INVALID`] entries are
    /// skipped. At most 254 dependencies.
    pub fn schedule_with_deps<P, F>(
        &self,
        param: P,
        func: F,
        deps: &[JobId],
    ) -> Result<JobId, SchedError>
    where
        P: Send + 'static,
        F: Fn(&JobContext<'_>, &mut P) + Send + 'static,
    {
        self.inner.publish(param, func, deps, None)
    }

    /// Run jobs on the calling thread until everything scheduled has
    /// finished.
    pub fn flush(&self) -> Result<(), SchedError> {
        while self.inner.live.load(Ordering::Acquire) > 0 {
            match self.inner.wait_for_ready() {
                Ok(short) => run_chain(&self.inner, short),
                Err(SchedError::TimedOut) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Run jobs on the calling thread until `id` has finished.
    ///
    /// Returns immediately for an already-finished (stale-generation)
    /// handle; rejects the reserved invalid handle.
    pub fn wait(&self, id: JobId) -> Result<(), SchedError> {
        if id.is_invalid() {
            return Err(SchedError::InvalidId);
        }
        while !self.is_finished(id) {
            match self.inner.wait_for_ready() {
                Ok(short) => run_chain(&self.inner, short),
                Err(SchedError::TimedOut) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Whether the job named by `id` has finished (its slot's generation
    /// has moved past the handle's).
    pub fn is_finished(&self, id: JobId) -> bool {
        let slot = &self.inner.slots[id.slot().0 as usize];
        slot.generation() != id.generation().0
    }

    /// Published jobs not yet finalised.
    pub fn pending(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Snapshot of the cumulative counters.
    pub fn metrics(&self) -> SchedMetrics {
        self.inner.counters.snapshot()
    }

    /// Signal shutdown, join the workers, and reset the pending
    /// counter. In-flight jobs run to completion; jobs still waiting on
    /// dependencies are abandoned (the caller was required to drain
    /// first).
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() && self.inner.system_state() == SystemState::Idle {
            return;
        }
        self.inner.state.store(SystemState::ShuttingDown as u8, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.inner.live.store(0, Ordering::Release);
        self.inner.state.store(SystemState::Idle as u8, Ordering::Release);
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl JobContext<'_> {
    /// Handle of the running job.
    pub fn job_id(&self) -> JobId {
        self.id
    }

    /// Spawn a child job. The current job will not finalise (and its
    /// handle's generation will not advance) until the child has
    /// finished.
    pub fn add_sub_job<P, F>(&self, param: P, func: F) -> Result<JobId, SchedError>
    where
        P: Send + 'static,
        F: Fn(&JobContext<'_>, &mut P) + Send + 'static,
    {
        self.add_sub_job_with_deps(param, func, &[])
    }

    /// Spawn a child job with its own dependencies.
    pub fn add_sub_job_with_deps<P, F>(
        &self,
        param: P,
        func: F,
        deps: &[JobId],
    ) -> Result<JobId, SchedError>
    where
        P: Send + 'static,
        F: Fn(&JobContext<'_>, &mut P) + Send + 'static,
    {
        let parent = self.id.slot();
        let parent_slot = &self.inner.slots[parent.0 as usize];
        // Pin the parent until the child finalises.
        let prev = parent_slot.dependencies.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "parent must still be pinned by its own dispatch");
        debug_assert!(prev < u8::MAX, "dependency counter overflow");
        match self.inner.publish(param, func, deps, Some(parent)) {
            Ok(id) => Ok(id),
            Err(e) => {
                // Unpin; the parent is mid-body, so this cannot reach 0.
                parent_slot.dependencies.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }
}

impl Inner {
    fn system_state(&self) -> SystemState {
        match self.state.load(Ordering::Acquire) {
            0 => SystemState::Idle,
            1 => SystemState::Running,
            _ => SystemState::ShuttingDown,
        }
    }

    /// Publish a job: obtain a slot, install the body and parameter,
    /// register permits on its dependencies, then release the
    /// publication pin.
    fn publish<P, F>(
        &self,
        param: P,
        func: F,
        deps: &[JobId],
        parent: Option<SlotIndex>,
    ) -> Result<JobId, SchedError>
    where
        P: Send + 'static,
        F: Fn(&JobContext<'_>, &mut P) + Send + 'static,
    {
        if self.system_state() == SystemState::ShuttingDown {
            return Err(SchedError::ShuttingDown);
        }
        assert!(deps.len() <= (u8::MAX - 1) as usize, "at most 254 dependencies");

        let short = self.free.dequeue().map_err(|_| SchedError::PoolExhausted)?;
        let slot = &self.slots[short as usize];
        let id = JobId::new(SlotIndex(short), Generation(slot.generation()));

        // Install the parameter blob (body + parameter, so zero-sized
        // function items cost nothing).
        let size = std::mem::size_of::<(F, P)>();
        let align = std::mem::align_of::<(F, P)>();
        let blob: *mut u8 = if size <= INLINE_PARAM_BYTES && align <= 8 {
            slot.set_kind(ParamKind::Inline);
            slot.param_ptr()
        } else {
            let ptr = {
                let mut heap = self.heap.lock().unwrap();
                heap.alloc(size, align)
            };
            match ptr {
                Ok(p) => {
                    slot.set_kind(ParamKind::External);
                    slot.set_external(ExternalParam { ptr: p.as_ptr(), size, align });
                    Counters::bump(&self.counters.external_params);
                    p.as_ptr()
                }
                Err(e) => {
                    // Hand the slot back untouched; its generation never
                    // moved, so no stale handle exists.
                    self.enqueue_free(short);
                    return Err(SchedError::from(e));
                }
            }
        };
        // SAFETY: blob points at storage of (size, align) owned by this
        // slot for the duration of the job.
        unsafe { (blob as *mut (F, P)).write((func, param)) };
        slot.set_run(run_blob::<P, F> as RawJobFn);

        // Publisher-exclusive phase: seed the permit list, with the
        // parent (if any) as the first successor to release.
        {
            slot.lock();
            let permits = slot.permits_mut();
            *permits = PermitList::EMPTY;
            if let Some(parent) = parent {
                permits.inline[0] = parent.0;
            }
            slot.unlock();
        }
        slot.set_state(SlotState::NotStarted);

        // The +1 pins the job until registration completes, so a
        // dependency finishing mid-loop cannot make it ready early.
        slot.dependencies.store(deps.len() as u8 + 1, Ordering::Release);
        self.live.fetch_add(1, Ordering::AcqRel);
        Counters::bump(&self.counters.jobs_scheduled);

        for dep in deps {
            match self.add_permit(*dep, short) {
                AddPermit::Added => {}
                AddPermit::AlreadyDone => {
                    // Cannot reach zero here: the publication pin is
                    // still held.
                    slot.dependencies.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        // Release the publication pin; if everything was already done
        // the job becomes ready now.
        let inline = self.release_dependency(short, false);
        debug_assert!(inline.is_none());
        Ok(id)
    }

    /// Register `successor` on the permit list of `dep`, walking (and if
    /// needed extending) the expansion chain.
    ///
    /// The chain walk locks hand-over-hand so a concurrent finalisation
    /// of `dep` cannot recycle a link while we hold a reference into it.
    fn add_permit(&self, dep: JobId, successor: u16) -> AddPermit {
        if dep.is_invalid() {
            return AddPermit::AlreadyDone;
        }
        debug_assert_ne!(dep.slot().0, successor, "a job cannot permit itself");
        'restart: loop {
            let head = &self.slots[dep.slot().0 as usize];
            head.lock();
            if head.generation() != dep.generation().0 {
                head.unlock();
                return AddPermit::AlreadyDone;
            }
            let mut current = head;
            loop {
                let permits = current.permits_mut();
                if let Some(empty) = permits.inline.iter().position(|&p| p == NO_PERMIT) {
                    permits.inline[empty] = successor;
                    current.unlock();
                    return AddPermit::Added;
                }
                if permits.expansion != NO_PERMIT {
                    let next = &self.slots[permits.expansion as usize];
                    next.lock();
                    current.unlock();
                    current = next;
                    continue;
                }
                // Inline entries exhausted and no chain yet: borrow a
                // slot from the pool as an expansion link. If the pool
                // is momentarily empty, drop the lock first and retry
                // from the head; a job finishing in the meantime both
                // frees slots and invalidates the registration, and the
                // generation re-check catches the latter.
                let link = match self.free.dequeue() {
                    Ok(s) => s,
                    Err(_) => {
                        current.unlock();
                        std::hint::spin_loop();
                        continue 'restart;
                    }
                };
                let link_slot = &self.slots[link as usize];
                // The link is unreachable until it is stored in
                // `expansion` below, so plain initialisation is
                // exclusive.
                link_slot.set_kind(ParamKind::Expansion);
                link_slot.set_state(SlotState::WaitingForChildren);
                link_slot.dependencies.store(1, Ordering::Release);
                {
                    let link_permits = link_slot.permits_mut();
                    *link_permits = PermitList::EMPTY;
                    link_permits.inline[0] = successor;
                }
                Counters::bump(&self.counters.permit_expansions);
                current.permits_mut().expansion = link;
                current.unlock();
                return AddPermit::Added;
            }
        }
    }

    /// Decrement dependency counters starting from `short`, finalising
    /// slots that drain and propagating through their permit snapshots.
    ///
    /// Runs over an explicit work list rather than recursing, so a deep
    /// DAG cannot exhaust the stack. With `allow_inline`, the first
    /// successor that becomes ready is handed back to the caller to run
    /// on this thread; every other one goes through the ready queue.
    fn release_dependency(&self, short: u16, allow_inline: bool) -> Option<u16> {
        let mut inline_next: Option<u16> = None;
        let mut work: SmallVec<[u16; 8]> = SmallVec::new();
        work.push(short);
        while let Some(s) = work.pop() {
            let slot = &self.slots[s as usize];
            let prev = slot.dependencies.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev >= 1, "dependency counter underflow");
            if prev != 1 {
                continue;
            }
            match slot.state() {
                SlotState::NotStarted => {
                    // Ready to run for the first time.
                    if allow_inline && inline_next.is_none() {
                        inline_next = Some(s);
                    } else {
                        self.enqueue_ready(s);
                    }
                }
                SlotState::WaitingForChildren => {
                    // Body returned and children drained (or this is an
                    // expansion link whose owner finished): finalise.
                    slot.lock();
                    let snapshot = slot.take_permits();
                    let kind = slot.kind();
                    slot.set_state(SlotState::Free);
                    slot.bump_generation();
                    slot.unlock();
                    if kind == ParamKind::Expansion {
                        // Borrowed link, was never a published job.
                    } else {
                        self.live.fetch_sub(1, Ordering::AcqRel);
                        Counters::bump(&self.counters.jobs_completed);
                    }
                    self.enqueue_free(s);
                    for &p in &snapshot.inline {
                        if p != NO_PERMIT {
                            work.push(p);
                        }
                    }
                    if snapshot.expansion != NO_PERMIT {
                        work.push(snapshot.expansion);
                    }
                }
                SlotState::Free => {
                    debug_assert!(false, "released a slot that is already free");
                }
            }
        }
        inline_next
    }

    /// Dequeue a ready short-ID, spinning up to the configured budget.
    fn wait_for_ready(&self) -> Result<u16, SchedError> {
        for attempt in 0..self.config.spin_budget {
            if self.system_state() == SystemState::ShuttingDown {
                return Err(SchedError::ShuttingDown);
            }
            if let Ok(short) = self.ready.dequeue() {
                return Ok(short);
            }
            if attempt % 64 == 63 {
                thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        Err(SchedError::TimedOut)
    }

    fn enqueue_ready(&self, short: u16) {
        // Capacity equals the pool size, so this can only be transiently
        // full; retry per the queue contract.
        while self.ready.enqueue(short).is_err() {
            Counters::bump(&self.counters.queue_full_retries);
            std::hint::spin_loop();
        }
    }

    fn enqueue_free(&self, short: u16) {
        while self.free.enqueue(short).is_err() {
            Counters::bump(&self.counters.queue_full_retries);
            std::hint::spin_loop();
        }
    }

    /// Run one job body and release its dispatch pin, returning the
    /// first successor that became ready (to be run inline).
    fn execute(&self, short: u16) -> Option<u16> {
        let slot = &self.slots[short as usize];
        // Re-arm the counter so children completing mid-body cannot
        // finalise the job under it.
        let prev = slot.dependencies.swap(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "dispatched a job with outstanding dependencies");
        slot.set_state(SlotState::WaitingForChildren);

        let ctx =
            JobContext { inner: self, id: JobId::new(SlotIndex(short), Generation(slot.generation())) };
        let kind = slot.kind();
        let run = slot.take_run().expect("published job carries an adapter");
        let blob = match kind {
            ParamKind::Inline => slot.param_ptr(),
            ParamKind::External => slot.external().ptr,
            ParamKind::Expansion => unreachable!("expansion links are never dispatched"),
        };
        // SAFETY: blob points at the (F, P) pair written at publication;
        // the adapter consumes it exactly once.
        unsafe { run(blob, &ctx) };

        if kind == ParamKind::External {
            let ext = slot.external();
            let mut heap = self.heap.lock().unwrap();
            // SAFETY: ext.ptr came from this heap at publication.
            heap.free(
                NonNull::new(ext.ptr).expect("external parameter pointer is non-null"),
                ext.size,
                ext.align,
            );
        }

        self.release_dependency(short, true)
    }
}

/// Run a job and keep running its inline-ready successors.
fn run_chain(inner: &Inner, mut short: u16) {
    loop {
        match inner.execute(short) {
            Some(next) => {
                Counters::bump(&inner.counters.inline_dispatches);
                short = next;
            }
            None => break,
        }
    }
}

/// Worker thread body: pull ready jobs until shutdown.
fn worker_loop(inner: &Inner) {
    loop {
        match inner.wait_for_ready() {
            Ok(short) => run_chain(inner, short),
            Err(SchedError::TimedOut) => continue,
            Err(_) => break,
        }
    }
}

/// Monomorphised adapter: reads the `(F, P)` blob, runs the body, and
/// drops the blob in place.
unsafe fn run_blob<P, F>(blob: *mut u8, ctx: &JobContext<'_>)
where
    P: Send + 'static,
    F: Fn(&JobContext<'_>, &mut P) + Send + 'static,
{
    let blob = blob as *mut (F, P);
    {
        // SAFETY (caller): blob holds a live (F, P) written at
        // publication.
        let (func, param) = &mut *blob;
        func(ctx, param);
    }
    // SAFETY: the pair is dropped exactly once, here.
    ptr::drop_in_place(blob);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn system() -> JobSystem {
        JobSystem::new(SchedConfig { num_slots: 256, ..Default::default() }).unwrap()
    }

    // ── Scheduling and flushing on the calling thread ────────────────

    #[test]
    fn scheduled_job_runs_once_on_flush() {
        let jobs = system();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = jobs
            .schedule(Arc::clone(&hits), |_, hits: &mut Arc<AtomicUsize>| {
                hits.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert!(!jobs.is_finished(id));
        jobs.flush().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(jobs.is_finished(id));
        assert_eq!(jobs.pending(), 0);
    }

    #[test]
    fn generation_advances_exactly_once_per_job() {
        let jobs = system();
        let a = jobs.schedule((), |_, _| {}).unwrap();
        jobs.flush().unwrap();
        let b = jobs.schedule((), |_, _| {}).unwrap();
        jobs.flush().unwrap();
        if a.slot() == b.slot() {
            assert_eq!(b.generation().0, a.generation().0.wrapping_add(1));
        }
    }

    #[test]
    fn dependency_orders_execution() {
        let jobs = system();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        let a = jobs
            .schedule(o, |_, o: &mut Arc<Mutex<Vec<u32>>>| o.lock().unwrap().push(1))
            .unwrap();
        let o = Arc::clone(&order);
        let b = jobs
            .schedule_with_deps(
                o,
                |_, o: &mut Arc<Mutex<Vec<u32>>>| o.lock().unwrap().push(2),
                &[a],
            )
            .unwrap();
        jobs.wait(b).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn finished_and_invalid_deps_are_skipped() {
        let jobs = system();
        let a = jobs.schedule((), |_, _| {}).unwrap();
        jobs.flush().unwrap();
        // a is finished; INVALID is a placeholder. Both release at
        // publication.
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let b = jobs
            .schedule_with_deps(
                r,
                |_, r: &mut Arc<AtomicBool>| r.store(true, Ordering::Relaxed),
                &[a, JobId::INVALID],
            )
            .unwrap();
        jobs.wait(b).unwrap();
        assert!(ran.load(Ordering::Relaxed));
    }

    #[test]
    fn fan_out_beyond_inline_permits() {
        // One predecessor, 16 successors: the permit list must expand
        // past its three inline entries.
        let jobs = system();
        let pred_done = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&pred_done);
        let a = jobs
            .schedule(d, |_, d: &mut Arc<AtomicBool>| d.store(true, Ordering::Release))
            .unwrap();
        for _ in 0..16 {
            let state =
                (Arc::clone(&pred_done), Arc::clone(&violations), Arc::clone(&hits));
            jobs.schedule_with_deps(
                state,
                |_, (done, violations, hits): &mut (Arc<AtomicBool>, Arc<AtomicUsize>, Arc<AtomicUsize>)| {
                    if !done.load(Ordering::Acquire) {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                    hits.fetch_add(1, Ordering::Relaxed);
                },
                &[a],
            )
            .unwrap();
        }
        jobs.flush().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 16);
        assert_eq!(violations.load(Ordering::Relaxed), 0);
        assert!(jobs.metrics().permit_expansions >= 1);
        // Expansion links went back to the pool: the full pool is
        // available again.
        assert_eq!(jobs.pending(), 0);
    }

    #[test]
    fn sub_jobs_pin_their_parent() {
        let jobs = system();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        let parent = jobs
            .schedule(o, |ctx, o: &mut Arc<Mutex<Vec<&'static str>>>| {
                o.lock().unwrap().push("parent-body");
                for _ in 0..3 {
                    let o = Arc::clone(o);
                    ctx.add_sub_job(o, |_, o: &mut Arc<Mutex<Vec<&'static str>>>| {
                        o.lock().unwrap().push("child");
                    })
                    .unwrap();
                }
            })
            .unwrap();
        jobs.wait(parent).unwrap();
        let order = order.lock().unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "parent-body");
        // The parent's handle only finished after all children ran.
        assert_eq!(order.iter().filter(|s| **s == "child").count(), 3);
    }

    #[test]
    fn dependent_of_parent_waits_for_grandchildren() {
        // B depends on A; A spawns children; B must observe their
        // effects because A's generation only advances after they
        // finalise.
        let jobs = system();
        let child_hits = Arc::new(AtomicUsize::new(0));
        let seen_by_b = Arc::new(AtomicUsize::new(usize::MAX));

        let c = Arc::clone(&child_hits);
        let a = jobs
            .schedule(c, |ctx, c: &mut Arc<AtomicUsize>| {
                for _ in 0..5 {
                    let c = Arc::clone(c);
                    ctx.add_sub_job(c, |_, c: &mut Arc<AtomicUsize>| {
                        c.fetch_add(1, Ordering::AcqRel);
                    })
                    .unwrap();
                }
            })
            .unwrap();
        let state = (Arc::clone(&child_hits), Arc::clone(&seen_by_b));
        let b = jobs
            .schedule_with_deps(
                state,
                |_, (hits, seen): &mut (Arc<AtomicUsize>, Arc<AtomicUsize>)| {
                    seen.store(hits.load(Ordering::Acquire), Ordering::Relaxed);
                },
                &[a],
            )
            .unwrap();
        jobs.wait(b).unwrap();
        assert_eq!(seen_by_b.load(Ordering::Relaxed), 5);
    }

    // ── Parameter passing ────────────────────────────────────────────

    #[test]
    fn large_parameters_go_external() {
        let jobs = system();
        let payload = [7u8; 256];
        let sum = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&sum);
        jobs.schedule(
            (s, payload),
            |_, (sum, payload): &mut (Arc<AtomicUsize>, [u8; 256])| {
                let total: usize = payload.iter().map(|&b| b as usize).sum();
                sum.store(total, Ordering::Relaxed);
            },
        )
        .unwrap();
        jobs.flush().unwrap();
        assert_eq!(sum.load(Ordering::Relaxed), 7 * 256);
        assert_eq!(jobs.metrics().external_params, 1);
    }

    #[test]
    fn external_parameter_buffers_are_returned_to_the_heap() {
        let jobs = system();
        for _ in 0..10 {
            jobs.schedule([0u8; 128], |_, _| {}).unwrap();
        }
        jobs.flush().unwrap();
        let heap = jobs.inner.heap.lock().unwrap();
        let stats = heap.stats();
        assert_eq!(stats.pooled_allocs, stats.pooled_frees);
    }

    #[test]
    fn parameters_are_dropped_exactly_once() {
        struct CountsDrops(Arc<AtomicUsize>);
        impl Drop for CountsDrops {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        let jobs = system();
        let drops = Arc::new(AtomicUsize::new(0));
        jobs.schedule(CountsDrops(Arc::clone(&drops)), |_, _| {}).unwrap();
        jobs.flush().unwrap();
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    // ── Errors and shutdown ──────────────────────────────────────────

    #[test]
    fn pool_exhaustion_is_reported() {
        let jobs = JobSystem::new(SchedConfig {
            num_slots: 2,
            ..Default::default()
        })
        .unwrap();
        // Fill the pool with jobs that can never run (waiting on a job
        // that is itself waiting).
        let a = jobs.schedule((), |_, _| {}).unwrap();
        let _b = jobs.schedule_with_deps((), |_, _| {}, &[a]).unwrap();
        // Slots are gone (a is ready-but-undrained, b waits on a).
        let err = jobs.schedule((), |_, _| {}).unwrap_err();
        assert_eq!(err, SchedError::PoolExhausted);
        jobs.flush().unwrap();
    }

    #[test]
    fn wait_rejects_the_invalid_handle() {
        let jobs = system();
        assert_eq!(jobs.wait(JobId::INVALID), Err(SchedError::InvalidId));
    }

    #[test]
    fn wait_on_finished_handle_returns_immediately() {
        let jobs = system();
        let a = jobs.schedule((), |_, _| {}).unwrap();
        jobs.flush().unwrap();
        jobs.wait(a).unwrap();
    }

    #[test]
    fn schedule_after_shutdown_is_rejected() {
        let mut jobs = system();
        jobs.startup();
        jobs.shutdown();
        // Shutdown resets to Idle, so scheduling works again (main-
        // thread mode); but during shutdown it is refused.
        jobs.inner.state.store(SystemState::ShuttingDown as u8, Ordering::Release);
        let err = jobs.schedule((), |_, _| {}).unwrap_err();
        assert_eq!(err, SchedError::ShuttingDown);
        jobs.inner.state.store(SystemState::Idle as u8, Ordering::Release);
    }

    #[test]
    fn startup_and_shutdown_join_workers() {
        let mut jobs = JobSystem::new(SchedConfig {
            num_slots: 64,
            worker_count: Some(2),
            ..Default::default()
        })
        .unwrap();
        jobs.startup();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let h = Arc::clone(&hits);
            jobs.schedule(h, |_, h: &mut Arc<AtomicUsize>| {
                h.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        jobs.flush().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 50);
        jobs.shutdown();
        assert_eq!(jobs.workers.len(), 0);
    }

    #[test]
    fn metrics_count_scheduled_and_completed() {
        let jobs = system();
        for _ in 0..5 {
            jobs.schedule((), |_, _| {}).unwrap();
        }
        jobs.flush().unwrap();
        let m = jobs.metrics();
        assert_eq!(m.jobs_scheduled, 5);
        assert_eq!(m.jobs_completed, 5);
    }
}
