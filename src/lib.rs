//! # Marrow
//!
//! In-process memory-management primitives for a language runtime:
//!
//! - **Arena**: region-based bump allocation over a linked chain of aligned
//!   buffers, with limited reclamation, in-place reallocation of the newest
//!   block, buffer release, and bulk reset ([`Arena`], [`ThreadSafeArena`])
//! - **Collector**: conservative mark-and-sweep over individually allocated
//!   blocks, discovering roots by scanning the active call-stack range for
//!   tracked addresses ([`GarbageCollector`])
//!
//! The two are independent; they share only the aligned allocation shim and
//! its invariants (power-of-two alignments, matched aligned-free, explicit
//! destructor handling).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  Arena / ThreadSafeArena      GarbageCollector   │
//! │        (arena.rs)                 (gc.rs)        │
//! │            │                         │           │
//! │            └──────────┬──────────────┘           │
//! │                       │                          │
//! │              aligned alloc shim                  │
//! │                  (alloc.rs)                      │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Hazard
//!
//! Conservative scanning cannot see pointers that live only in registers;
//! release-mode optimization can therefore defeat it. Keep collector-managed
//! pointers in addressable locals and pin long-lived roots with
//! [`GarbageCollector::mark_keep_alive`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod arena;
pub mod gc;

// Re-exports
pub use alloc::{AllocStats, DEFAULT_ALIGNMENT, alloc_stats, page_size};
pub use arena::{Arena, ArenaStats, DEFAULT_MIN_REGION_CAPACITY, ReleasedRegion, ThreadSafeArena};
pub use gc::{DropFn, GarbageCollector, GcMark, Word};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
