//! Slab allocators backing checkpoint metadata and COW slots.
//!
//! Both pools sit on anonymous page-aligned mappings reserved up front, so
//! nothing the fault handler allocates can re-enter the global heap while a
//! checkpoint is in flight:
//!
//! - [`BumpPool`] - monotonic arena for internal metadata (touch-log segments,
//!   the COW slot bitmap). Never reclaims.
//! - [`CowPool`] - bitmap allocator over page-sized slots; the bounded stash
//!   for pre-write page images. Exhaustion is back-pressure, not growth.
//! - [`TouchLog`] - append-only record list whose segments come from the bump
//!   arena; the only collection the fault handler ever appends to.

mod bump;
mod cow;
mod touch;

pub use bump::BumpPool;
pub use cow::CowPool;
pub use touch::TouchLog;

use thiserror::Error;

/// Errors raised while reserving or carving up the slab mappings.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The anonymous backing mapping could not be created.
    #[error("failed to map {requested} bytes for the {pool} pool: {source}")]
    Map {
        /// Pool that requested the mapping.
        pool: &'static str,
        /// Requested mapping size in bytes.
        requested: usize,
        /// Underlying OS error.
        source: region::Error,
    },

    /// The bump arena ran out of reserved space.
    #[error("{pool} pool exhausted: requested {requested} bytes, {remaining} remaining")]
    Exhausted {
        pool: &'static str,
        requested: usize,
        remaining: usize,
    },
}
