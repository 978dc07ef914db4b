//! Region/page manager: the checkpoint state machine.
//!
//! The manager owns the page map, services write faults, and sequences the
//! dedup, COW, and replication subsystems around one asynchronous writer
//! thread. Every tracked page moves through
//! `COMMITTED → SCHEDULED → IN_PROGRESS → COMMITTED` per cycle (or stays
//! `COMMITTED` when dedup discards it), and the fault handler decides per
//! write whether to copy the page aside, stall until the writer commits it,
//! or simply lift the protection and record the touch.
//!
//! Locking follows the original discipline: the page map, touch log, and
//! counters share one mutex (`table`), the writer-wakeup state another
//! (`work`), and the COW pool keeps its own. Condition waits always pair with
//! the mutex guarding their predicate.

mod writer;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use region::Protection;
use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::alloc::{AllocError, BumpPool, CowPool, TouchLog};
use crate::config::CheckpointConfig;
use crate::dedup::DedupEngine;
use crate::repl::ReplError;
use crate::transport::{Collective, Rank, TransportError};

/// Errors surfaced through the public manager API.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// A collective failed; the cycle was aborted and the manager is idle.
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Repl(#[from] ReplError),

    #[error("checkpoint file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-cycle page lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PageState {
    Committed,
    Scheduled,
    InProgress,
}

/// How the fault handler serviced a trapped write; the declaration order is
/// the writer's access-order sort key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessKind {
    /// Stalled until the writer committed the page.
    Wait,
    /// Pre-write image copied into a COW slot.
    Cow,
    /// Fault on an already-committed page while a cycle was running.
    After,
    /// Fault with no cycle in flight (incremental first touch).
    Delayed,
}

/// One serviced fault, as recorded in the touch log.
#[derive(Clone, Copy, Debug)]
pub struct TouchRecord {
    pub addr: usize,
    pub kind: AccessKind,
}

struct PageInfo {
    state: PageState,
    cow: Option<NonNull<u8>>,
}

/// Counters accumulated since the start of the previous cycle.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CycleStats {
    pub pages_cow: u64,
    pub pages_wait: u64,
    pub pages_after: u64,
    pub pages_delayed: u64,
}

/// Point-in-time counters for `display_stats` and the test suite.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StatsSnapshot {
    pub rank: Rank,
    pub total_tracked_bytes: u64,
    pub seq_no: u64,
    pub pages_cow: u64,
    pub pages_wait: u64,
    pub pages_after: u64,
    pub pages_delayed: u64,
    pub committed_pages: u64,
}

struct PageTable {
    pages: FxHashMap<usize, PageInfo>,
    touch: TouchLog<TouchRecord>,
    stats: CycleStats,
    total_bytes: u64,
    /// Pages flushed by the writer in the current/last cycle.
    committed_pages: u64,
}

// SAFETY: the COW pointers inside belong to the manager's own pool and are
// only dereferenced by whichever thread holds the table lock.
unsafe impl Send for PageTable {}

/// Writer iteration order for one cycle.
enum WriteOrder {
    /// Touch snapshot, walked back to front.
    Touched(Vec<TouchRecord>),
    /// Touch snapshot first, then a sweep of the full page map
    /// (access-order mode with incremental off).
    TouchedThenFull(Vec<TouchRecord>),
    /// Full page map.
    Full,
}

/// Everything the writer needs for one cycle, built under the table lock.
struct CyclePlan {
    order: WriteOrder,
    /// `load[0]` = local writes; `load[j]` = pages sent on replica slot `j`.
    load: Vec<u32>,
    /// Residual replica copies per page, from the global dedup owner lists.
    residual: FxHashMap<usize, u32>,
}

struct WorkState {
    /// A cycle is being prepared or written; serializes `checkpoint()`.
    cycle_active: bool,
    plan: Option<CyclePlan>,
}

pub(crate) struct Shared {
    cfg: CheckpointConfig,
    page_size: usize,
    cow_threshold: u64,
    meta: Arc<BumpPool>,
    cow: CowPool,
    table: Mutex<PageTable>,
    page_cond: Condvar,
    work: Mutex<WorkState>,
    work_cond: Condvar,
    /// Mirror of "a writer pass is running", readable from the fault path.
    ckpt_active: AtomicBool,
    shutdown: AtomicBool,
    seq_no: AtomicU64,
    group: Arc<dyn Collective>,
    dedup: Mutex<DedupEngine>,
}

/// The per-process checkpoint engine root.
pub struct RegionManager {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl RegionManager {
    /// Builds the manager and starts its writer thread.
    pub fn new(
        cfg: CheckpointConfig,
        group: Arc<dyn Collective>,
    ) -> Result<Self, ManagerError> {
        let page_size = region::page::size();
        let meta = Arc::new(BumpPool::new(BumpPool::DEFAULT_CAPACITY)?);
        let cow = CowPool::new(page_size, cfg.cow_bytes(), &meta)?;
        let cow_threshold = (cfg.cow_bytes() / page_size) as u64;
        if cow_threshold == 0 && !cfg.incremental {
            warn!(
                rank = group.rank(),
                "COW pool is empty and incremental mode is off: every write \
                 during a checkpoint will stall on the writer"
            );
        }
        let dedup = DedupEngine::new(group.rank(), cfg.replication_factor);
        let shared = Arc::new(Shared {
            cow_threshold,
            page_size,
            cow,
            table: Mutex::new(PageTable {
                pages: FxHashMap::default(),
                touch: TouchLog::new(Arc::clone(&meta)),
                stats: CycleStats::default(),
                total_bytes: 0,
                committed_pages: 0,
            }),
            meta,
            page_cond: Condvar::new(),
            work: Mutex::new(WorkState {
                cycle_active: false,
                plan: None,
            }),
            work_cond: Condvar::new(),
            ckpt_active: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            seq_no: AtomicU64::new(0),
            group,
            dedup: Mutex::new(dedup),
            cfg,
        });
        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("blobcr-writer".into())
                .spawn(move || writer::run(shared))
                .map_err(|source| ManagerError::Io {
                    path: "<writer thread>".into(),
                    source,
                })?
        };
        info!(
            rank = shared.group.rank(),
            config = %serde_json::to_string(&shared.cfg).unwrap_or_default(),
            "checkpointer initialized"
        );
        Ok(Self {
            shared,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Rank of this manager within its group.
    pub fn rank(&self) -> Rank {
        self.shared.group.rank()
    }

    /// Registers a page-aligned range; every page starts `COMMITTED`.
    ///
    /// Misaligned ranges and ranges overlapping a live region are ignored
    /// (returns `false`). In incremental mode the range is immediately
    /// protected read-only so first touches get recorded.
    pub fn add_region(&self, addr: usize, len: usize) -> bool {
        let ps = self.shared.page_size;
        if len == 0 || addr % ps != 0 || len % ps != 0 {
            debug!(addr, len, "ignoring misaligned region");
            return false;
        }
        let mut table = lock(&self.shared.table);
        if (addr..addr + len)
            .step_by(ps)
            .any(|page| table.pages.contains_key(&page))
        {
            debug!(addr, len, "ignoring region overlapping a live region");
            return false;
        }
        for page in (addr..addr + len).step_by(ps) {
            table.pages.insert(
                page,
                PageInfo {
                    state: PageState::Committed,
                    cow: None,
                },
            );
        }
        table.total_bytes += len as u64;
        if self.shared.cfg.incremental {
            protect(addr, len, Protection::READ);
        }
        true
    }

    /// Deregisters a range, waiting out any in-flight commits, and restores
    /// read-write protection.
    pub fn remove_region(&self, addr: usize, len: usize) {
        let ps = self.shared.page_size;
        let mut table = lock(&self.shared.table);
        for page in (addr..addr.saturating_add(len)).step_by(ps) {
            loop {
                match table.pages.get(&page).map(|info| info.state) {
                    None => break,
                    Some(PageState::Committed) => {
                        table.pages.remove(&page);
                        table.total_bytes -= ps as u64;
                        break;
                    }
                    Some(_) => table = wait(&self.shared.page_cond, table),
                }
            }
        }
        drop(table);
        protect(addr, len, Protection::READ_WRITE);
    }

    /// Blocks until no checkpoint cycle is active.
    pub fn wait_for_completion(&self) {
        let mut work = lock(&self.shared.work);
        while work.cycle_active && !self.shared.shutdown.load(Ordering::Acquire) {
            work = wait(&self.shared.work_cond, work);
        }
    }

    /// Initiates one checkpoint cycle and returns once the writer has been
    /// signaled. Synchronize with [`wait_for_completion`](Self::wait_for_completion).
    pub fn checkpoint(&self) -> Result<(), ManagerError> {
        let shared = &*self.shared;
        {
            let mut work = lock(&shared.work);
            while work.cycle_active {
                if shared.shutdown.load(Ordering::Acquire) {
                    return Ok(());
                }
                work = wait(&shared.work_cond, work);
            }
            work.cycle_active = true;
        }

        info!(
            rank = shared.group.rank(),
            stats = %serde_json::to_string(&self.stats_snapshot()).unwrap_or_default(),
            "checkpoint started"
        );

        // Snapshot the touch list and reset this cycle's counters.
        let touched = {
            let mut table = lock(&shared.table);
            table.stats = CycleStats::default();
            table.committed_pages = 0;
            table.touch.snapshot_and_reset()
        };

        match self.prepare_cycle(touched) {
            Ok(plan) => {
                let mut work = lock(&shared.work);
                work.plan = Some(plan);
                shared.ckpt_active.store(true, Ordering::Release);
                shared.work_cond.notify_one();
                drop(work);
                std::thread::yield_now();
                Ok(())
            }
            Err(error) => {
                // Collective failure: surface it and return to idle.
                error!(rank = shared.group.rank(), %error, "checkpoint cycle aborted during dedup");
                let mut work = lock(&shared.work);
                work.cycle_active = false;
                shared.work_cond.notify_all();
                Err(error)
            }
        }
    }

    /// Dedup pass, protection barrier, page scheduling, and plan building.
    fn prepare_cycle(&self, touched: Vec<TouchRecord>) -> Result<CyclePlan, ManagerError> {
        let shared = &*self.shared;
        let cfg = &shared.cfg;
        let ps = shared.page_size;

        // Candidate pages: in incremental mode only the touched ones.
        let candidates: Vec<usize> = {
            let table = lock(&shared.table);
            if cfg.incremental {
                let mut seen = rustc_hash::FxHashSet::default();
                touched
                    .iter()
                    .map(|record| record.addr)
                    .filter(|addr| table.pages.contains_key(addr) && seen.insert(*addr))
                    .collect()
            } else {
                table.pages.keys().copied().collect()
            }
        };

        let dedup_guard = if cfg.dedup {
            let mut engine = lock(&shared.dedup);
            engine.clear();
            for addr in &candidates {
                // SAFETY: tracked pages stay mapped while registered; pre-
                // barrier reads may race application writes, which only
                // weakens dedup, never correctness of the written image.
                let bytes = unsafe { std::slice::from_raw_parts(*addr as *const u8, ps) };
                engine.process_page(*addr, bytes);
            }
            engine.finalize_local();
            if cfg.global_dedup {
                engine.global_dedup(&*shared.group)?;
            }
            let totals = engine.reduced_stats(&*shared.group)?;
            if shared.group.rank() == 0 {
                debug!(
                    local = totals.local,
                    global = totals.global,
                    total = totals.total,
                    "dedup statistics"
                );
            }
            Some(engine)
        } else {
            None
        };
        let dedup = dedup_guard.as_deref();

        // Barrier: re-protect everything read-only and mark the survivors
        // SCHEDULED in one critical section, so no fault can slip between
        // the two steps.
        let mut table = lock(&shared.table);
        let mut all_pages: Vec<usize> = table.pages.keys().copied().collect();
        all_pages.sort_unstable();
        protect_runs(&all_pages, ps, Protection::READ);

        let mut scheduled: Vec<usize> = Vec::new();
        for addr in &candidates {
            if let Some(info) = table.pages.get_mut(addr) {
                if info.state == PageState::Committed
                    && dedup.is_none_or(|engine| engine.check_page(*addr))
                {
                    info.state = PageState::Scheduled;
                    scheduled.push(*addr);
                }
            }
        }

        // Replication load vector and residual-copy map.
        let rep = cfg.replication_factor;
        let mut load = vec![0u32; rep.max(1) as usize];
        load[0] = scheduled.len() as u32;
        let mut residual = FxHashMap::default();
        if cfg.is_replicated() {
            for addr in &scheduled {
                let owners = dedup.and_then(|engine| engine.owner_ranks(*addr).map(<[Rank]>::len));
                // copies = k − 1 − (rank-list size − 1): slots the owner list
                // already covers need no further pushes.
                let copies = rep.saturating_sub(owners.unwrap_or(1) as u32);
                if owners.is_some() {
                    residual.insert(*addr, copies);
                }
                for slot in 1..=copies as usize {
                    load[slot] += 1;
                }
            }
        }

        let order = if cfg.access_order {
            let mut sorted = touched;
            sorted.sort_by_key(|record| (record.kind, record.addr));
            if cfg.incremental {
                WriteOrder::Touched(sorted)
            } else {
                WriteOrder::TouchedThenFull(sorted)
            }
        } else if cfg.incremental {
            WriteOrder::Touched(touched)
        } else {
            WriteOrder::Full
        };

        Ok(CyclePlan {
            order,
            load,
            residual,
        })
    }

    /// Services one trapped write. Returns `false` when the address is not
    /// tracked here and the fault must be re-raised.
    pub fn handle_fault(&self, addr: usize) -> bool {
        let shared = &*self.shared;
        let ps = shared.page_size;
        let page = addr & !(ps - 1);

        let mut table = lock(&shared.table);
        let state = match table.pages.get(&page) {
            None => return false,
            Some(info) => info.state,
        };

        let kind = match state {
            PageState::Scheduled if table.stats.pages_cow < shared.cow_threshold => {
                let Some(slot) = shared.cow.alloc_slot() else {
                    // The per-cycle gate guarantees a free slot; a miss means
                    // the pool metadata is corrupt.
                    error!(page, "COW pool drained below its threshold, aborting");
                    std::process::abort();
                };
                // SAFETY: the page is mapped and readable (the trap was a
                // write); the slot is page-sized and exclusively ours.
                unsafe {
                    std::ptr::copy_nonoverlapping(page as *const u8, slot.as_ptr(), ps);
                }
                if let Some(info) = table.pages.get_mut(&page) {
                    info.cow = Some(slot);
                }
                table.stats.pages_cow += 1;
                AccessKind::Cow
            }
            PageState::Scheduled | PageState::InProgress => {
                // Pool drained (or page already being written): stall until
                // the writer commits this page.
                loop {
                    match table.pages.get(&page).map(|info| info.state) {
                        None | Some(PageState::Committed) => break,
                        Some(_) => table = wait(&shared.page_cond, table),
                    }
                }
                table.stats.pages_wait += 1;
                AccessKind::Wait
            }
            PageState::Committed => {
                if shared.ckpt_active.load(Ordering::Acquire) {
                    table.stats.pages_after += 1;
                    AccessKind::After
                } else {
                    table.stats.pages_delayed += 1;
                    AccessKind::Delayed
                }
            }
        };

        // The WAIT path leaves protection to the writer (which already
        // restored read-write on commit in non-incremental mode).
        if shared.cfg.incremental || kind != AccessKind::Wait {
            protect(page, ps, Protection::READ_WRITE);
        }
        if let Err(error) = table.touch.push(TouchRecord { addr: page, kind }) {
            error!(%error, "touch log exhausted the metadata arena, aborting");
            std::process::abort();
        }
        true
    }

    /// Logs the counters accumulated since the last checkpoint.
    pub fn display_stats(&self) {
        info!(
            rank = self.shared.group.rank(),
            stats = %serde_json::to_string(&self.stats_snapshot()).unwrap_or_default(),
            "stats since last checkpoint"
        );
    }

    /// Current counters; primarily for harnesses and tests.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let table = lock(&self.shared.table);
        StatsSnapshot {
            rank: self.shared.group.rank(),
            total_tracked_bytes: table.total_bytes,
            seq_no: self.shared.seq_no.load(Ordering::Acquire),
            pages_cow: table.stats.pages_cow,
            pages_wait: table.stats.pages_wait,
            pages_after: table.stats.pages_after,
            pages_delayed: table.stats.pages_delayed,
            committed_pages: table.committed_pages,
        }
    }

    /// Page size backing this manager.
    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    /// Bytes handed out of the metadata arena so far.
    pub fn metadata_bytes(&self) -> usize {
        self.shared.meta.used()
    }
}

impl Drop for RegionManager {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.work_cond.notify_all();
        if let Some(handle) = lock(&self.writer).take() {
            handle.join().ok();
        }
        // Lift every remaining protection and drop the map.
        let mut table = lock(&self.shared.table);
        let mut pages: Vec<usize> = table.pages.keys().copied().collect();
        pages.sort_unstable();
        protect_runs(&pages, self.shared.page_size, Protection::READ_WRITE);
        table.pages.clear();
        table.total_bytes = 0;
        // Anyone still parked on a per-page wait re-checks and bails out.
        self.shared.page_cond.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard)
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Changes protection on one contiguous range, logging failures; a page that
/// cannot be protected degrades tracking, not correctness.
fn protect(addr: usize, len: usize, prot: Protection) {
    // SAFETY: callers only pass ranges inside regions the application
    // registered (and therefore owns) or just handed back.
    if let Err(error) = unsafe { region::protect(addr as *const u8, len, prot) } {
        warn!(addr, len, %error, "mprotect failed");
    }
}

/// Protects a sorted page list, coalescing adjacent pages into single calls.
fn protect_runs(pages_sorted: &[usize], ps: usize, prot: Protection) {
    let mut i = 0;
    while i < pages_sorted.len() {
        let start = pages_sorted[i];
        let mut end = start + ps;
        while i + 1 < pages_sorted.len() && pages_sorted[i + 1] == end {
            i += 1;
            end += ps;
        }
        protect(start, end - start, prot);
        i += 1;
    }
}
