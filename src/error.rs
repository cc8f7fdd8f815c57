//! Error types for the zone and hunk allocators.
//!
//! Spec distinguishes two severities (see `DESIGN.md`): `Fatal` conditions
//! indicate corrupted allocator state or caller misuse that the engine's
//! `ERR_FATAL` would abort on, and `Drop` conditions are ordinary recoverable
//! failures (`ERR_DROP`). This crate never aborts the process itself; callers
//! decide what to do with a `Fatal` value.

use crate::tag::Tag;

/// Top-level error type returned by every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    /// Indicates corrupted allocator bookkeeping or a caller invariant
    /// violation. The allocator that produced this error should not be
    /// trusted for further use.
    #[error("{zone} zone fatal error: {reason} (size={size:?}, tag={tag:?})")]
    Fatal {
        zone: &'static str,
        reason: &'static str,
        size: Option<usize>,
        tag: Option<Tag>,
    },

    /// A hunk or zone allocation request could not be satisfied; the
    /// allocator remains usable.
    #[error("{zone} out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        zone: &'static str,
        requested: usize,
        available: usize,
    },

    /// `z_free`/`hunk_free_temp` was called with a null pointer.
    #[error("free() called with a null pointer")]
    NullFree,

    /// Size overflowed during rounding/alignment arithmetic.
    #[error("{zone}: requested size {requested} overflows during allocation bookkeeping")]
    SizeOverflow { zone: &'static str, requested: usize },

    /// The raw region provider failed to supply memory.
    #[error("failed to acquire a {len}-byte raw region: {reason}")]
    RegionUnavailable { len: usize, reason: String },
}

impl MemError {
    pub fn fatal(zone: &'static str, reason: &'static str) -> Self {
        log::error!("{zone}: fatal: {reason}");
        MemError::Fatal { zone, reason, size: None, tag: None }
    }

    pub fn fatal_with(
        zone: &'static str,
        reason: &'static str,
        size: usize,
        tag: Tag,
    ) -> Self {
        log::error!("{zone}: fatal: {reason} (size={size}, tag={tag:?})");
        MemError::Fatal { zone, reason, size: Some(size), tag: Some(tag) }
    }

    /// True for the `ERR_FATAL`-equivalent family of variants.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MemError::Fatal { .. })
    }
}

pub type MemResult<T> = Result<T, MemError>;
