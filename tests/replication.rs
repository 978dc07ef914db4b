//! Replication factor two, distinct content per rank: every rank's replica
//! file is a byte-for-byte copy of exactly one peer's checkpoint file, and
//! the peer assignment is a bijection.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use blobcr::config::CheckpointConfig;
use blobcr::runtime;
use blobcr::transport::{Collective, LocalGroup};

const RANKS: u32 = 4;
const PAGES: usize = 16;

fn run_rank(endpoint: Arc<dyn Collective>, dir: PathBuf) {
    let rank = endpoint.rank();
    let handle = runtime::start_with(
        CheckpointConfig::default()
            .with_path_prefix(dir)
            .with_replication_factor(2),
        endpoint,
    )
    .expect("start");
    let ps = handle.page_size();

    let buf = common::Protected::alloc(&handle, PAGES * ps);
    for index in 0..PAGES {
        // Rank-distinct content so no two files can collide by accident.
        common::stamp_page(buf.data(), index, ps);
        buf.data()[index * ps + 8] = rank as u8 + 1;
    }

    handle.checkpoint().expect("checkpoint");
    handle.wait_for_checkpoint();
}

#[test]
fn replica_files_mirror_one_peer_each() {
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

    let ckpts: Vec<Vec<u8>> = (0..RANKS)
        .map(|rank| std::fs::read(common::ckpt_path(dir.path(), rank, 0)).expect("ckpt"))
        .collect();
    for (rank, image) in ckpts.iter().enumerate() {
        assert_eq!(image.len(), PAGES * ps, "rank {rank} local file");
    }

    let mut mirrored_peer: Vec<usize> = Vec::new();
    for rank in 0..RANKS {
        let replica = std::fs::read(common::repl_path(dir.path(), rank, 0)).expect("replica");
        assert_eq!(replica.len(), PAGES * ps, "rank {rank} replica size");
        let source = ckpts
            .iter()
            .position(|ckpt| *ckpt == replica)
            .unwrap_or_else(|| panic!("rank {rank} replica matches no peer checkpoint"));
        assert_ne!(source, rank as usize, "a rank must not replicate itself");
        mirrored_peer.push(source);
    }
    mirrored_peer.sort_unstable();
    mirrored_peer.dedup();
    assert_eq!(
        mirrored_peer.len(),
        RANKS as usize,
        "replica sources must form a bijection"
    );
}
