//! Cross-rank dedup: four ranks with identical buffers produce exactly one
//! written copy of each distinct page across the whole group.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use blobcr::config::CheckpointConfig;
use blobcr::runtime;
use blobcr::transport::{Collective, LocalGroup};

const RANKS: u32 = 4;
const PAGES: usize = 16;

fn run_rank(endpoint: Arc<dyn Collective>, dir: PathBuf) {
    let handle = runtime::start_with(
        CheckpointConfig::default()
            .with_path_prefix(dir)
            .with_dedup(true, true),
        endpoint,
    )
    .expect("start");
    let ps = handle.page_size();

    let buf = common::Protected::alloc(&handle, PAGES * ps);
    for index in 0..PAGES {
        common::stamp_page(buf.data(), index, ps);
    }

    handle.checkpoint().expect("checkpoint");
    handle.wait_for_checkpoint();
}

#[test]
fn each_unique_page_is_written_by_exactly_one_rank() {
    let dir = common::scratch();
    let ps = region::page::size();

    let workers: Vec<_> = LocalGroup::new(RANKS)
        .into_iter()
        .map(|endpoint| {
            let dir = dir.path().to_path_buf();
            std::thread::spawn(move || run_rank(Arc::new(endpoint), dir))
        })
        .collect();
    for worker in workers {
        worker.join().expect("rank thread");
    }

    let mut written: Vec<Vec<u8>> = Vec::new();
    for rank in 0..RANKS {
        written.extend(common::read_pages(
            &common::ckpt_path(dir.path(), rank, 0),
            ps,
        ));
    }
    assert_eq!(
        written.len(),
        PAGES,
        "identical working sets must collapse to one copy per distinct page"
    );

    let mut expected: Vec<Vec<u8>> = (0..PAGES).map(|i| common::stamped_page(i, ps)).collect();
    written.sort();
    expected.sort();
    assert_eq!(written, expected, "every distinct page survives somewhere");
}
