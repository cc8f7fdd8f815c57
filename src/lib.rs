//! `zonehunk`: a two-allocator game-engine memory subsystem.
//!
//! A tagged, coalescing [`zone::Zone`] allocator for general-purpose,
//! bulk-freeable allocations, and a double-ended [`hunk::Hunk`] stack
//! allocator for permanent and LIFO-temporary allocations, combined behind
//! [`system::System`]. Both are single-threaded: the public API takes
//! `&mut self` throughout rather than relying on interior synchronization.

pub mod config;
pub mod error;
pub mod hunk;
pub mod region;
pub mod stats;
pub mod system;
pub mod tag;
pub mod zone;

pub use config::Config;
pub use error::{MemError, MemResult};
pub use hunk::{Hunk, Preference};
pub use region::{HeapRegionSource, OsRegionSource, Region, RegionSource};
pub use stats::Stats;
pub use system::System;
pub use tag::Tag;
pub use zone::Zone;
