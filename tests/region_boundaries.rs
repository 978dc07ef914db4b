//! Region registration edge cases: misalignment, overlap, one-page regions,
//! and deregistration.

mod common;

use blobcr::config::CheckpointConfig;
use blobcr::runtime;
use blobcr::transport::LocalGroup;

#[test]
fn registration_edges() {
    let dir = common::scratch();
    let handle = runtime::start_with(
        CheckpointConfig::default().with_path_prefix(dir.path()),
        LocalGroup::solo(),
    )
    .expect("start");
    let ps = handle.page_size();

    // A size that is not a page multiple is a no-op.
    let buf = common::Protected::alloc(&handle, 4 * ps);
    assert!(
        !handle.add_region(buf.ptr.as_ptr(), ps + 1),
        "misaligned length must be rejected"
    );

    // Overlapping a live region is rejected wholesale.
    assert!(!handle.add_region(buf.ptr.as_ptr(), ps));

    // One-page region: the smallest legal unit round-trips.
    let single = common::Protected::alloc(&handle, ps);
    single.data().fill(0x42);
    handle.checkpoint().expect("checkpoint");
    handle.wait_for_checkpoint();
    let pages = common::read_pages(&common::ckpt_path(dir.path(), 0, 0), ps);
    assert_eq!(pages.len(), 5, "four tracked pages plus the single page");
    assert!(pages.iter().any(|page| page.iter().all(|b| *b == 0x42)));

    // After deregistration nothing of the buffer is written again.
    drop(single);
    handle.checkpoint().expect("second checkpoint");
    handle.wait_for_checkpoint();
    let pages = common::read_pages(&common::ckpt_path(dir.path(), 0, 1), ps);
    assert_eq!(pages.len(), 4);

    // A checkpoint with nothing registered still produces an (empty) file.
    drop(buf);
    handle.checkpoint().expect("empty checkpoint");
    handle.wait_for_checkpoint();
    let pages = common::read_pages(&common::ckpt_path(dir.path(), 0, 2), ps);
    assert!(pages.is_empty());
}
