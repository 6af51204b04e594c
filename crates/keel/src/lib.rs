//! Keel: the runtime substrate for data-oriented engine code.
//!
//! This is the top-level facade crate that re-exports the public API
//! from the Keel sub-crates. For most users, adding `keel` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use keel::prelude::*;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! // Scratch memory from the block heap.
//! let mut heap = BlockHeap::new();
//! let buf = heap.alloc(256, 64).unwrap();
//! heap.free(buf, 256, 64);
//!
//! // A small dependency chain through the job system, drained on the
//! // calling thread.
//! let jobs = JobSystem::new(SchedConfig::default()).unwrap();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let h = Arc::clone(&hits);
//! let first = jobs
//!     .schedule(h, |_, h: &mut Arc<AtomicUsize>| {
//!         h.fetch_add(1, Ordering::Relaxed);
//!     })
//!     .unwrap();
//! let h = Arc::clone(&hits);
//! let second = jobs
//!     .schedule_with_deps(
//!         h,
//!         |_, h: &mut Arc<AtomicUsize>| {
//!             h.fetch_add(1, Ordering::Relaxed);
//!         },
//!         &[first],
//!     )
//!     .unwrap();
//! jobs.wait(second).unwrap();
//! assert_eq!(hits.load(Ordering::Relaxed), 2);
//! ```
//!
//! # Modules
//!
//! Each module corresponds to a sub-crate. Use them for types not in
//! the prelude:
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `keel-core` | Job identifiers, error types, alignment math |
//! | [`alloc`] | `keel-alloc` | Page runs, chunk schemas, arena, block heap |
//! | [`sched`] | `keel-sched` | Bounded MPMC queue, job system, metrics |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core identifiers, errors, and alignment utilities (`keel-core`).
pub mod types {
    pub use keel_core::*;
}

/// Memory primitives (`keel-alloc`).
pub mod alloc {
    pub use keel_alloc::*;
}

/// Queue and job system (`keel-sched`).
pub mod sched {
    pub use keel_sched::*;
}

/// The types most users need, importable in one line.
pub mod prelude {
    pub use keel_alloc::{BlockHeap, ChunkSchema, FieldLayout, HeapConfig, PageArena};
    pub use keel_core::{AllocError, JobId, QueueError, SchedError};
    pub use keel_sched::{BoundedQueue, JobContext, JobSystem, SchedConfig, SchedMetrics};
}

pub use keel_alloc::{BlockHeap, PageArena};
pub use keel_core::JobId;
pub use keel_sched::{JobSystem, SchedConfig};
