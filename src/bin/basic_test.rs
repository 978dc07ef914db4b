//! Smoke harness: fill a buffer, checkpoint it, overwrite it mid-cycle, and
//! verify both the in-memory image and the checkpoint file.

use std::error::Error;
use std::path::PathBuf;

use blobcr::runtime;

const SIZE: usize = 1 << 24; // 16 MiB

fn main() -> Result<(), Box<dyn Error>> {
    let handle = runtime::start()?;

    println!("Alloc 16 MB of data...");
    let buf = handle.alloc_protected(SIZE).ok_or("mapping failed")?;
    // SAFETY: alloc_protected returned a live read-write mapping of SIZE.
    let data = unsafe { std::slice::from_raw_parts_mut(buf.as_ptr(), SIZE) };
    data.fill(b'A');

    println!("Checkpointing...");
    handle.checkpoint()?;
    // Overwrite while the writer drains; every page goes through COW or WAIT.
    data.fill(b'B');
    handle.wait_for_checkpoint();

    print!("Testing result...");
    match data.iter().position(|byte| *byte != b'B') {
        Some(offset) => println!("FAILED at offset: {offset}"),
        None => println!("OK!"),
    }

    let prefix = std::env::var("CKPT_PATH_PREFIX").unwrap_or_else(|_| "/tmp".into());
    let ckpt = PathBuf::from(prefix).join("blobcr-ckpt-0-0.dat");
    let image = std::fs::read(&ckpt)?;
    print!("Testing checkpoint image...");
    if image.len() == SIZE && image.iter().all(|byte| *byte == b'A') {
        println!("OK!");
    } else {
        println!("FAILED ({} bytes)", image.len());
    }

    handle.display_stats();
    handle.free_protected(buf, SIZE);
    Ok(())
}
