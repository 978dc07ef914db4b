//! # blobcr: transparent incremental checkpointing with dedup and replication
//!
//! blobcr snapshots registered memory regions of an HPC-style process to local
//! persistent storage while the application keeps running. Writes that land in
//! a region mid-checkpoint are trapped through page protection and either
//! copied aside (copy-on-write) or briefly stalled, so every checkpoint is a
//! consistent point-in-time image with minimal pause.
//!
//! ## Core concepts
//!
//! - **Region**: a page-aligned range of virtual memory registered for
//!   checkpointing; tracked page by page.
//! - **Checkpoint cycle**: one `checkpoint()` call; dedup filtering, a
//!   protection barrier, then an asynchronous writer pass that evicts every
//!   scheduled page to `blobcr-ckpt-<rank>-<seq>.dat`.
//! - **COW slot**: a page-sized buffer holding the pre-mutation image of a
//!   page whose write arrived while the page was still waiting on the writer.
//!   The pool is bounded; once it drains, faulting writers wait instead.
//! - **Dedup**: content-addressed filtering, locally per rank and optionally
//!   across all ranks (top-K most frequent digests, one writer per digest).
//! - **Replication**: each retained page is pushed to *k−1* peers through
//!   one-sided puts so the checkpoint survives the loss of *k−1* ranks.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use blobcr::config::CheckpointConfig;
//! use blobcr::runtime;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = runtime::start_with(
//!     CheckpointConfig::from_env(),
//!     blobcr::transport::LocalGroup::solo(),
//! )?;
//!
//! let buf = handle.alloc_protected(1 << 24).expect("mapping failed");
//! // ... mutate the buffer ...
//! handle.checkpoint()?;
//! handle.wait_for_checkpoint();
//! # Ok(())
//! # }
//! ```
//!
//! C callers link the cdylib and use the [`ffi`] surface
//! (`start_checkpointer`, `add_region`, `checkpoint`, ...), configured
//! entirely through environment variables.
//!
//! ## Module guide
//!
//! - [`alloc`] - slab allocators: the metadata bump arena and the COW pool
//! - [`config`] - environment-driven configuration
//! - [`dedup`] - content digests, local filtering, global top-K reduction
//! - [`manager`] - region/page manager: fault servicing and the writer thread
//! - [`repl`] - replication engine: peer placement and one-sided page pushes
//! - [`runtime`] - process-wide lifecycle and the SIGSEGV dispatch path
//! - [`telemetry`] - tracing setup and per-rank log routing
//! - [`transport`] - group communication contract and the in-process group
//! - [`ffi`] - C ABI shim

pub mod alloc;
pub mod config;
pub mod dedup;
pub mod ffi;
pub mod manager;
pub mod repl;
pub mod runtime;
pub mod telemetry;
pub mod transport;

pub use config::CheckpointConfig;
pub use manager::{RegionManager, StatsSnapshot};
pub use runtime::Handle;
pub use transport::{Collective, LocalGroup, Rank};
