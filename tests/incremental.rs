//! Incremental mode: only pages touched since the previous cycle are written,
//! in reverse insertion order of the touch log.

mod common;

use blobcr::config::CheckpointConfig;
use blobcr::runtime;
use blobcr::transport::LocalGroup;

#[test]
fn only_touched_pages_reach_the_file() {
    let dir = common::scratch();
    let handle = runtime::start_with(
        CheckpointConfig::default()
            .with_path_prefix(dir.path())
            .with_incremental(true),
        LocalGroup::solo(),
    )
    .expect("start");
    let ps = handle.page_size();

    // 1024 tracked pages, protected on registration; the first write to each
    // page traps as a DELAYED touch.
    let buf = common::Protected::alloc(&handle, 1024 * ps);
    for index in 0..10 {
        common::stamp_page(buf.data(), index, ps);
    }

    handle.checkpoint().expect("checkpoint");
    handle.wait_for_checkpoint();

    let stats = handle.stats();
    assert_eq!(stats.committed_pages, 10);

    let pages = common::read_pages(&common::ckpt_path(dir.path(), 0, 0), ps);
    assert_eq!(pages.len(), 10, "exactly the touched pages are written");
    // The touch log snapshot is walked back to front.
    for (position, page) in pages.iter().enumerate() {
        assert_eq!(page, &common::stamped_page(9 - position, ps));
    }

    // Untouched between cycles: the next checkpoint writes nothing.
    handle.checkpoint().expect("idle checkpoint");
    handle.wait_for_checkpoint();
    let pages = common::read_pages(&common::ckpt_path(dir.path(), 0, 1), ps);
    assert!(pages.is_empty());

    // Touching a single page schedules exactly that page again.
    common::stamp_page(buf.data(), 500, ps);
    handle.checkpoint().expect("third checkpoint");
    handle.wait_for_checkpoint();
    let pages = common::read_pages(&common::ckpt_path(dir.path(), 0, 2), ps);
    assert_eq!(pages, vec![common::stamped_page(500, ps)]);
}
