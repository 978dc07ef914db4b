//! Shared helpers for the scenario tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use blobcr::runtime::Handle;

/// Scratch directory for checkpoint and replica files.
pub fn scratch() -> tempfile::TempDir {
    tempfile::tempdir().expect("scratch dir")
}

/// Mutable view of a protected allocation.
///
/// # Safety contract
/// `ptr` must come from `Handle::alloc_protected(len)` and stay registered.
pub fn buffer<'a>(ptr: NonNull<u8>, len: usize) -> &'a mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) }
}

/// Path of rank `rank`'s checkpoint file for sequence `seq`.
pub fn ckpt_path(dir: &Path, rank: u32, seq: u64) -> PathBuf {
    dir.join(format!("blobcr-ckpt-{rank}-{seq}.dat"))
}

/// Path of rank `rank`'s replica file for sequence `seq`.
pub fn repl_path(dir: &Path, rank: u32, seq: u64) -> PathBuf {
    dir.join(format!("blobcr-repl-{rank}-{seq}.dat"))
}

/// Reads a checkpoint file and splits it into page-sized chunks.
pub fn read_pages(path: &Path, page_size: usize) -> Vec<Vec<u8>> {
    let bytes = std::fs::read(path).unwrap_or_else(|err| panic!("read {path:?}: {err}"));
    assert_eq!(
        bytes.len() % page_size,
        0,
        "checkpoint files are whole pages"
    );
    bytes.chunks(page_size).map(<[u8]>::to_vec).collect()
}

/// Fills page `index` of `data` with a pattern unique to that index.
pub fn stamp_page(data: &mut [u8], index: usize, page_size: usize) {
    let page = &mut data[index * page_size..(index + 1) * page_size];
    page.fill((index % 251) as u8);
    page[..8].copy_from_slice(&(index as u64).to_le_bytes());
}

/// The pattern `stamp_page` writes for page `index`.
pub fn stamped_page(index: usize, page_size: usize) -> Vec<u8> {
    let mut page = vec![(index % 251) as u8; page_size];
    page[..8].copy_from_slice(&(index as u64).to_le_bytes());
    page
}

/// RAII wrapper releasing a protected allocation on drop.
pub struct Protected<'h> {
    pub handle: &'h Handle,
    pub ptr: NonNull<u8>,
    pub len: usize,
}

impl<'h> Protected<'h> {
    pub fn alloc(handle: &'h Handle, len: usize) -> Self {
        let ptr = handle.alloc_protected(len).expect("protected mapping");
        Self { handle, ptr, len }
    }

    pub fn data(&self) -> &mut [u8] {
        buffer(self.ptr, self.len)
    }
}

impl Drop for Protected<'_> {
    fn drop(&mut self) {
        self.handle.free_protected(self.ptr, self.len);
    }
}
