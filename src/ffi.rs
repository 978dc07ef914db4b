//! C ABI shim.
//!
//! The C surface is shaped around one checkpointer per process, because the
//! fault handler must dispatch somewhere without context. `start_checkpointer`
//! reads the environment and brings the singleton up; `terminate_checkpointer`
//! flushes stats and tears it down. Everything in between silently no-ops when
//! the singleton is missing or the arguments are malformed; a C caller that
//! misregisters a buffer loses checkpoint coverage, not its process.
//!
//! Panics never cross the ABI: each entry point catches unwinds and aborts,
//! matching the fatal-error policy of the engine itself.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::Mutex;

use tracing::error;

use crate::runtime::{self, Handle};

static CHECKPOINTER: Mutex<Option<Handle>> = Mutex::new(None);

/// Runs `body`, turning any panic into an abort so unwinding never crosses
/// the C boundary.
fn guarded<R>(body: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        // A panic this deep means engine state is unknown; do not hand a
        // half-torn checkpoint back to C.
        Err(_) => std::process::abort(),
    }
}

/// Snapshot of the live handle, taken without holding the singleton lock
/// across potentially blocking engine calls.
fn current() -> Option<&'static Handle> {
    let guard = CHECKPOINTER
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    // SAFETY: the singleton is only replaced by start/terminate; C callers
    // are contractually required to bracket all other calls between them
    // (the same lifetime rule the original C API imposes).
    guard
        .as_ref()
        .map(|handle| unsafe { &*(handle as *const Handle) })
}

/// Initializes the checkpointer from the environment. Idempotent per process.
#[unsafe(no_mangle)]
pub extern "C" fn start_checkpointer() {
    guarded(|| {
        let mut singleton = CHECKPOINTER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if singleton.is_some() {
            return;
        }
        match runtime::start() {
            Ok(handle) => *singleton = Some(handle),
            Err(err) => {
                // Fatal by policy: a process that asked for checkpointing
                // but cannot get it must not keep computing.
                error!(error = %err, "checkpointer failed to start");
                std::process::abort();
            }
        }
    });
}

/// Tears the checkpointer down, flushing stats and restoring the previous
/// fault handler.
#[unsafe(no_mangle)]
pub extern "C" fn terminate_checkpointer() {
    guarded(|| {
        let handle = CHECKPOINTER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.display_stats();
        }
    });
}

/// Registers `[addr, addr + size)`. Returns `addr` unchanged; misaligned
/// sizes, `MAP_FAILED`, and a missing checkpointer are silently ignored.
#[unsafe(no_mangle)]
pub extern "C" fn add_region(addr: *mut c_void, size: usize) -> *mut c_void {
    guarded(|| {
        if let Some(handle) = current()
            && addr != libc::MAP_FAILED
            && size % handle.page_size() == 0
        {
            handle.add_region(addr.cast(), size);
        }
        addr
    })
}

/// Deregisters a range, waiting for in-flight commits.
#[unsafe(no_mangle)]
pub extern "C" fn remove_region(addr: *mut c_void, size: usize) {
    guarded(|| {
        if let Some(handle) = current() {
            handle.remove_region(addr.cast(), size);
        }
    });
}

/// Maps a page-rounded anonymous buffer and registers it. NULL on failure.
#[unsafe(no_mangle)]
pub extern "C" fn malloc_protected(size: usize) -> *mut c_void {
    guarded(|| match current() {
        Some(handle) => handle
            .alloc_protected(size)
            .map_or(std::ptr::null_mut(), |ptr| ptr.as_ptr().cast()),
        None => std::ptr::null_mut(),
    })
}

/// Deregisters and unmaps a `malloc_protected` buffer.
#[unsafe(no_mangle)]
pub extern "C" fn free_protected(ptr: *mut c_void, size: usize) {
    guarded(|| {
        if let (Some(handle), Some(ptr)) = (current(), NonNull::new(ptr.cast::<u8>())) {
            handle.free_protected(ptr, size);
        }
    });
}

/// Initiates a checkpoint cycle. Returns 0 only when no checkpointer is
/// initialized, 1 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn checkpoint() -> c_int {
    guarded(|| match current() {
        Some(handle) => {
            if let Err(err) = handle.checkpoint() {
                error!(error = %err, "checkpoint cycle failed");
            }
            1
        }
        None => 0,
    })
}

/// Blocks until the current checkpoint cycle has drained.
#[unsafe(no_mangle)]
pub extern "C" fn wait_for_checkpoint() {
    guarded(|| {
        if let Some(handle) = current() {
            handle.wait_for_checkpoint();
        }
    });
}

/// Logs counters accumulated since the last checkpoint.
#[unsafe(no_mangle)]
pub extern "C" fn display_stats() {
    guarded(|| {
        if let Some(handle) = current() {
            handle.display_stats();
        }
    });
}
