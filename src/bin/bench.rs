//! Single-rank throughput harness.
//!
//! Touches every page of a buffer in ascending, shuffled, and descending
//! order, checkpointing every tenth pass. Combine with `INCREMENTAL_FLAG`
//! and `ACCESS_ORDER_FLAG` to exercise the touch-driven writer paths.
//!
//! Usage: `bench [bytes]` (default 2^30).

use std::error::Error;
use std::time::Instant;

use rand::seq::SliceRandom;

use blobcr::runtime::{self, Handle};

const ITERATIONS: usize = 30;
const CHECKPOINT_EVERY: usize = 10;

fn perform_test(desc: &str, order: &[usize], data: &mut [u8], page_size: usize, handle: &Handle) {
    println!("Starting {desc} access test...");
    let started = Instant::now();
    for iteration in 1..=ITERATIONS {
        for page in order {
            let slot = &mut data[page * page_size..(page + 1) * page_size];
            for byte in slot {
                *byte = byte.wrapping_add(1);
            }
        }
        if iteration % CHECKPOINT_EVERY == 0 {
            handle.checkpoint().expect("checkpoint");
            handle.wait_for_checkpoint();
        }
        print!(".");
        use std::io::Write;
        std::io::stdout().flush().ok();
    }
    println!();
    println!(
        "{desc} access iterations complete: {:.3}s",
        started.elapsed().as_secs_f64()
    );
}

fn main() -> Result<(), Box<dyn Error>> {
    let size: usize = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(1 << 30);

    let handle = runtime::start()?;
    let page_size = handle.page_size();
    let pages = size / page_size;

    let buf = handle
        .alloc_protected(size)
        .ok_or("could not map the benchmark buffer")?;
    // SAFETY: alloc_protected returned a live read-write mapping of `size`.
    let data = unsafe { std::slice::from_raw_parts_mut(buf.as_ptr(), size) };

    let mut order: Vec<usize> = (0..pages).collect();
    perform_test("ascending", &order, data, page_size, &handle);

    order.shuffle(&mut rand::rng());
    perform_test("random", &order, data, page_size, &handle);

    order = (0..pages).rev().collect();
    perform_test("descending", &order, data, page_size, &handle);

    handle.display_stats();
    handle.free_protected(buf, size);
    Ok(())
}
