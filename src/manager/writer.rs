//! The asynchronous checkpoint writer.
//!
//! One thread per manager. It sleeps on the work condition, and per cycle:
//! opens `blobcr-ckpt-<rank>-<seq>.dat`, stands up the replication engine
//! when configured, evicts every scheduled page (COW image when one exists,
//! the live page otherwise), commits each page and wakes its waiters, then
//! makes the file durable and broadcasts completion. Cancellation is
//! cooperative between pages.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{error, info};

use crate::repl::ReplEngine;

use super::{CyclePlan, ManagerError, PageState, Shared, WriteOrder, lock, wait};

pub(crate) fn run(shared: Arc<Shared>) {
    loop {
        let plan = {
            let mut work = lock(&shared.work);
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(plan) = work.plan.take() {
                    break plan;
                }
                work = wait(&shared.work_cond, work);
            }
        };

        match run_cycle(&shared, plan) {
            Ok(pages) => {
                let seq_no = shared.seq_no.fetch_add(1, Ordering::AcqRel);
                info!(
                    rank = shared.group.rank(),
                    seq_no, pages, "checkpoint complete"
                );
            }
            Err(error) => {
                error!(
                    rank = shared.group.rank(),
                    %error,
                    "checkpoint cycle aborted, returning to idle"
                );
                recover(&shared);
            }
        }

        shared.ckpt_active.store(false, Ordering::Release);
        lock(&shared.work).cycle_active = false;
        shared.work_cond.notify_all();
    }
}

fn run_cycle(shared: &Shared, plan: CyclePlan) -> Result<u64, ManagerError> {
    let cfg = &shared.cfg;
    let rank = shared.group.rank();
    let seq_no = shared.seq_no.load(Ordering::Acquire);
    let path = cfg
        .path_prefix
        .join(format!("blobcr-ckpt-{rank}-{seq_no}.dat"));
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|source| ManagerError::Io {
            path: path.clone(),
            source,
        })?;

    let mut repl = if cfg.is_replicated() {
        Some(ReplEngine::init(
            &*shared.group,
            cfg.replication_factor,
            shared.page_size,
            &plan.load,
            &cfg.path_prefix,
            seq_no,
            plan.residual,
        )?)
    } else {
        None
    };

    let mut evict = |addr: usize| -> Result<(), ManagerError> {
        handle_page(shared, addr, &mut file, &path, repl.as_mut())
    };

    match &plan.order {
        WriteOrder::Touched(records) | WriteOrder::TouchedThenFull(records) => {
            for record in records.iter().rev() {
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
                evict(record.addr)?;
            }
        }
        WriteOrder::Full => {}
    }
    if matches!(plan.order, WriteOrder::Full | WriteOrder::TouchedThenFull(_)) {
        let mut pages: Vec<usize> = lock(&shared.table).pages.keys().copied().collect();
        pages.sort_unstable();
        for addr in pages {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            evict(addr)?;
        }
    }

    file.sync_data().map_err(|source| ManagerError::Io {
        path: path.clone(),
        source,
    })?;
    drop(file);
    if let Some(engine) = repl.take() {
        engine.finalize(&*shared.group)?;
    }
    Ok(lock(&shared.table).committed_pages)
}

/// Evicts one page: SCHEDULED → IN_PROGRESS → write → replicate → COMMITTED.
fn handle_page(
    shared: &Shared,
    addr: usize,
    file: &mut File,
    path: &std::path::Path,
    repl: Option<&mut ReplEngine>,
) -> Result<(), ManagerError> {
    let ps = shared.page_size;
    let src = {
        let mut table = lock(&shared.table);
        match table.pages.get_mut(&addr) {
            Some(info) if info.state == PageState::Scheduled => {
                info.state = PageState::InProgress;
                info.cow.map_or(addr, |slot| slot.as_ptr() as usize)
            }
            // Already committed this cycle (duplicate touch record) or
            // dropped by dedup; nothing to do.
            _ => return Ok(()),
        }
    };

    // SAFETY: while IN_PROGRESS the source is stable: the live page is
    // read-only (writers stall in the fault handler) and a COW slot is
    // exclusively ours until freed below.
    let bytes = unsafe { std::slice::from_raw_parts(src as *const u8, ps) };
    // write_all retries short counts and EINTR until the page is delivered.
    file.write_all(bytes).map_err(|source| ManagerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(engine) = repl {
        engine.replicate(&*shared.group, addr, bytes)?;
    }

    let had_cow = {
        let mut table = lock(&shared.table);
        let had_cow = match table.pages.get_mut(&addr) {
            Some(info) => {
                info.state = PageState::Committed;
                info.cow.take()
            }
            None => None,
        };
        table.committed_pages += 1;
        shared.page_cond.notify_all();
        had_cow
    };

    match had_cow {
        Some(slot) => shared.cow.free_slot(slot),
        // The page itself was written; reopen it unless incremental mode
        // keeps it protected to trap the next first touch.
        None if !shared.cfg.incremental => super::protect(addr, ps, region::Protection::READ_WRITE),
        None => {}
    }
    Ok(())
}

/// Returns every non-committed page to COMMITTED after an aborted cycle so
/// waiters resume and `remove_region` cannot hang.
fn recover(shared: &Shared) {
    let mut slots: Vec<NonNull<u8>> = Vec::new();
    {
        let mut table = lock(&shared.table);
        for info in table.pages.values_mut() {
            if info.state != PageState::Committed {
                info.state = PageState::Committed;
                if let Some(slot) = info.cow.take() {
                    slots.push(slot);
                }
            }
        }
        shared.page_cond.notify_all();
    }
    for slot in slots {
        shared.cow.free_slot(slot);
    }
}
