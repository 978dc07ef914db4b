//! The canonical overwrite-during-checkpoint scenario: the file must hold the
//! image from the instant the cycle scheduled its pages, while the application
//! keeps mutating freely.

mod common;

use blobcr::config::CheckpointConfig;
use blobcr::runtime;
use blobcr::transport::LocalGroup;

#[test]
fn file_keeps_the_scheduled_image_while_memory_moves_on() {
    let dir = common::scratch();
    let handle = runtime::start_with(
        CheckpointConfig::default().with_path_prefix(dir.path()),
        LocalGroup::solo(),
    )
    .expect("start");

    let size = 1 << 24; // 16 MiB
    let buf = common::Protected::alloc(&handle, size);
    buf.data().fill(b'A');

    handle.checkpoint().expect("checkpoint");
    // Every one of these writes lands mid-cycle and is trapped through the
    // COW path (the default pool holds far more than 4096 slots).
    buf.data().fill(b'B');
    handle.wait_for_checkpoint();

    assert!(
        buf.data().iter().all(|byte| *byte == b'B'),
        "application memory must show the new contents"
    );

    let image = std::fs::read(common::ckpt_path(dir.path(), 0, 0)).expect("ckpt file");
    assert_eq!(image.len(), size, "one page written per tracked page");
    assert!(
        image.iter().all(|byte| *byte == b'A'),
        "checkpoint image must be the pre-overwrite contents"
    );

    let stats = handle.stats();
    assert_eq!(stats.seq_no, 1);
    assert_eq!(stats.committed_pages, (size / handle.page_size()) as u64);
    // Pages the writer had already committed (and reopened) by the time the
    // overwrite reached them never fault, so the trap counters are bounded by
    // the page count rather than equal to it.
    assert!(
        stats.pages_cow + stats.pages_wait + stats.pages_after
            <= (size / handle.page_size()) as u64
    );

    // A second cycle picks a fresh sequence number and the new contents.
    handle.checkpoint().expect("second checkpoint");
    handle.wait_for_checkpoint();
    let image = std::fs::read(common::ckpt_path(dir.path(), 0, 1)).expect("second ckpt file");
    assert!(image.iter().all(|byte| *byte == b'B'));
}
