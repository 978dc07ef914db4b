//! Process-wide lifecycle: manager registry and fault dispatch.
//!
//! The OS delivers one SIGSEGV stream per process, so managers register here
//! and the trap handler walks the registry until one of them consumes the
//! fault. A single-rank process holds exactly one manager; the in-process
//! multi-rank harnesses hold one per rank thread, distinguished by the
//! disjoint address ranges they track.
//!
//! `start_with` brackets everything: build the manager, register it, install
//! the trap. Dropping the returned [`Handle`] unwinds in reverse.

mod signal;

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::config::CheckpointConfig;
use crate::manager::{ManagerError, RegionManager, StatsSnapshot};
use crate::transport::{Collective, LocalGroup, Rank};

/// Errors from bringing the checkpointer up or down.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("could not install the fault handler: {source}")]
    Signal {
        #[source]
        source: io::Error,
    },
}

/// A running checkpointer bound to one rank.
///
/// All public operations of the engine hang off this handle; dropping it
/// deregisters the manager, restores the previous fault handler (when this
/// was the last live handle), and joins the writer thread.
pub struct Handle {
    manager: Arc<RegionManager>,
}

/// Starts a checkpointer from the environment on a single-rank group.
pub fn start() -> Result<Handle, RuntimeError> {
    start_with(CheckpointConfig::from_env(), LocalGroup::solo())
}

/// Starts a checkpointer with an explicit configuration and group.
pub fn start_with(
    cfg: CheckpointConfig,
    group: Arc<dyn Collective>,
) -> Result<Handle, RuntimeError> {
    crate::telemetry::init(cfg.log_prefix.as_deref(), group.rank());
    let manager = Arc::new(RegionManager::new(cfg, group)?);
    register(&manager);
    if let Err(source) = signal::install() {
        deregister(&manager);
        return Err(RuntimeError::Signal { source });
    }
    Ok(Handle { manager })
}

impl Handle {
    /// Registers a page-aligned buffer for checkpointing.
    pub fn add_region(&self, addr: *mut u8, len: usize) -> bool {
        self.manager.add_region(addr as usize, len)
    }

    /// Deregisters a buffer, waiting out in-flight commits.
    pub fn remove_region(&self, addr: *mut u8, len: usize) {
        self.manager.remove_region(addr as usize, len);
    }

    /// Anonymously maps `size` bytes (rounded up to a page multiple) and
    /// registers the mapping. `None` when the mapping fails.
    pub fn alloc_protected(&self, size: usize) -> Option<NonNull<u8>> {
        let ps = self.manager.page_size();
        let mut len = size - (size % ps);
        if len < size {
            len += ps;
        }
        if len == 0 {
            return None;
        }
        // SAFETY: fresh anonymous private mapping, checked below.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return None;
        }
        self.manager.add_region(base as usize, len);
        NonNull::new(base.cast())
    }

    /// Deregisters and unmaps a buffer from
    /// [`alloc_protected`](Self::alloc_protected).
    pub fn free_protected(&self, addr: NonNull<u8>, size: usize) {
        let ps = self.manager.page_size();
        let mut len = size - (size % ps);
        if len < size {
            len += ps;
        }
        self.manager.remove_region(addr.as_ptr() as usize, len);
        if len > 0 {
            // SAFETY: undoes the alloc_protected mapping of the same length.
            unsafe { libc::munmap(addr.as_ptr().cast(), len) };
        }
    }

    /// Initiates a checkpoint cycle; pair with
    /// [`wait_for_checkpoint`](Self::wait_for_checkpoint).
    pub fn checkpoint(&self) -> Result<(), ManagerError> {
        self.manager.checkpoint()
    }

    /// Blocks until the current cycle has fully drained.
    pub fn wait_for_checkpoint(&self) {
        self.manager.wait_for_completion();
    }

    /// Logs counters accumulated since the last checkpoint.
    pub fn display_stats(&self) {
        self.manager.display_stats();
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.manager.stats_snapshot()
    }

    pub fn rank(&self) -> Rank {
        self.manager.rank()
    }

    pub fn page_size(&self) -> usize {
        self.manager.page_size()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        deregister(&self.manager);
        signal::uninstall();
    }
}

/// Fault-dispatch registry: an immutable snapshot swapped atomically so the
/// trap handler never takes a lock. Old snapshots are leaked on purpose: a
/// concurrent fault may still be walking one, and churn is bounded by
/// start/shutdown calls.
static MANAGERS: AtomicPtr<Vec<Arc<RegionManager>>> = AtomicPtr::new(std::ptr::null_mut());
static REGISTRY_EDIT: Mutex<()> = Mutex::new(());

fn register(manager: &Arc<RegionManager>) {
    let _edit = REGISTRY_EDIT
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut next = snapshot().map(|v| v.to_vec()).unwrap_or_default();
    next.push(Arc::clone(manager));
    MANAGERS.store(Box::into_raw(Box::new(next)), Ordering::Release);
}

fn deregister(manager: &Arc<RegionManager>) {
    let _edit = REGISTRY_EDIT
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut next = snapshot().map(|v| v.to_vec()).unwrap_or_default();
    next.retain(|m| !Arc::ptr_eq(m, manager));
    MANAGERS.store(Box::into_raw(Box::new(next)), Ordering::Release);
}

fn snapshot() -> Option<&'static Vec<Arc<RegionManager>>> {
    let ptr = MANAGERS.load(Ordering::Acquire);
    // SAFETY: snapshots are only ever published whole and never freed.
    (!ptr.is_null()).then(|| unsafe { &*ptr })
}

/// Routes a trapped access to whichever manager tracks the address.
pub(crate) fn dispatch_fault(addr: usize) -> bool {
    let Some(managers) = snapshot() else {
        return false;
    };
    let serviced = managers.iter().any(|m| m.handle_fault(addr));
    if !serviced {
        debug!(addr, "fault outside tracked regions, re-raising");
    }
    serviced
}
