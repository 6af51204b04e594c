//! Memory primitives for the Keel runtime substrate.
//!
//! Provides the OS page facade, the structure-of-arrays chunk layout
//! schema, the all-at-once page arena, and the segregated-size-class
//! block heap. This crate is one of two that may contain `unsafe` code
//! (along with `keel-sched`); every unsafe block carries a `// SAFETY:`
//! comment.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod arena;
pub mod config;
pub mod heap;
pub mod layout;
pub mod pages;

pub use arena::PageArena;
pub use config::{ConfigError, HeapConfig};
pub use heap::{BlockHeap, HeapStats};
pub use layout::{ChunkSchema, FieldLayout};
pub use pages::{PageRun, PAGE_SIZE};
