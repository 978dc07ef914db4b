//! Multi-rank harness over the in-process group.
//!
//! Spawns one thread per rank, each with its own buffer and checkpointer, and
//! times collective checkpoints across three content regimes: identical
//! everywhere, distinct per page but identical across ranks, and distinct
//! everywhere. Combine with `DEDUP_FLAG`/`GLOBAL_DEDUP_FLAG` and
//! `REPLICATION_FACTOR` to exercise the cross-rank paths.
//!
//! Usage: `dist_bench [log2_bytes] [ranks]` (defaults: 30, 2).

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use blobcr::config::CheckpointConfig;
use blobcr::runtime::{self, Handle};
use blobcr::transport::{Collective, LocalGroup};

fn timed_checkpoint(desc: &str, group: &dyn Collective, handle: &Handle) {
    group.barrier().expect("barrier");
    if group.rank() == 0 {
        println!("Starting test {desc}");
    }
    let started = Instant::now();
    handle.checkpoint().expect("checkpoint");
    let initiated = started.elapsed();
    print!(".");
    handle.wait_for_checkpoint();
    let drained = started.elapsed();
    print!("+");
    group.barrier().expect("barrier");
    if group.rank() == 0 {
        println!();
        println!(
            "{desc} - checkpoint() {:.3}s, wait_for_checkpoint() {:.3}s, total {:.3}s",
            initiated.as_secs_f64(),
            drained.as_secs_f64(),
            started.elapsed().as_secs_f64()
        );
        println!("Finished!");
    }
}

fn run_rank(endpoint: Arc<dyn Collective>, size: usize) -> Result<(), String> {
    let rank = endpoint.rank();
    let handle = runtime::start_with(CheckpointConfig::from_env(), Arc::clone(&endpoint))
        .map_err(|err| err.to_string())?;
    let page_size = handle.page_size();
    let pages = size / page_size;

    let buf = handle
        .alloc_protected(size)
        .ok_or_else(|| format!("rank {rank}: could not map {size} bytes"))?;
    // SAFETY: alloc_protected returned a live read-write mapping of `size`.
    let data = unsafe { std::slice::from_raw_parts_mut(buf.as_ptr(), size) };

    // Same content everywhere.
    data.fill(0xFF);
    timed_checkpoint("SAME EVERYWHERE", &*endpoint, &handle);

    // Distinct per page, identical across ranks.
    for page in 0..pages {
        data[page * page_size..page * page_size + 4]
            .copy_from_slice(&(page as u32).to_ne_bytes());
    }
    timed_checkpoint("DIFF LOCALLY, SAME EVERYWHERE", &*endpoint, &handle);

    // Distinct everywhere.
    for page in 0..pages {
        data[page * page_size + 4..page * page_size + 8].copy_from_slice(&rank.to_ne_bytes());
    }
    timed_checkpoint("DIFF EVERYWHERE", &*endpoint, &handle);

    handle.free_protected(buf, size);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let log2_size: u32 = args.get(1).and_then(|arg| arg.parse().ok()).unwrap_or(30);
    let ranks: u32 = args.get(2).and_then(|arg| arg.parse().ok()).unwrap_or(2);
    let size = 1usize << log2_size;

    let workers: Vec<_> = LocalGroup::new(ranks)
        .into_iter()
        .map(|endpoint| {
            let endpoint: Arc<dyn Collective> = Arc::new(endpoint);
            std::thread::spawn(move || run_rank(endpoint, size))
        })
        .collect();
    for worker in workers {
        worker.join().map_err(|_| "rank thread panicked")??;
    }
    Ok(())
}
