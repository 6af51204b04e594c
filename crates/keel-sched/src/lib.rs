//! Job scheduling for the Keel runtime substrate.
//!
//! Provides the bounded lock-free MPMC ring queue and the job system
//! built on it: a fixed pool of generation-tagged job slots, dependency
//! chains, permit lists with unbounded fan-out, parent/child spawning,
//! and cooperative waiting. This crate is one of two that may contain
//! `unsafe` code (along with `keel-alloc`); every unsafe block carries a
//! `// SAFETY:` comment.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod metrics;
pub mod queue;
mod slot;
pub mod system;

pub use config::{ConfigError, SchedConfig};
pub use metrics::SchedMetrics;
pub use queue::BoundedQueue;
pub use system::{JobContext, JobSystem};
