//! Incremental + access-order mode across several touch patterns: every
//! checkpoint writes exactly the touched set, whole pages only.

mod common;

use blobcr::config::CheckpointConfig;
use blobcr::runtime;
use blobcr::transport::LocalGroup;

#[test]
fn touched_sets_round_trip_in_any_touch_order() {
    let dir = common::scratch();
    let handle = runtime::start_with(
        CheckpointConfig::default()
            .with_path_prefix(dir.path())
            .with_incremental(true)
            .with_access_order(true),
        LocalGroup::solo(),
    )
    .expect("start");
    let ps = handle.page_size();

    let total_pages = 64;
    let buf = common::Protected::alloc(&handle, total_pages * ps);

    let passes: [Vec<usize>; 3] = [
        (0..20).collect(),                      // ascending
        (10..40).rev().collect(),               // descending
        (0..total_pages).step_by(7).collect(),  // strided
    ];

    for (seq, touched) in passes.iter().enumerate() {
        for index in touched {
            common::stamp_page(buf.data(), *index, ps);
        }
        handle.checkpoint().expect("checkpoint");
        handle.wait_for_checkpoint();

        let mut pages = common::read_pages(&common::ckpt_path(dir.path(), 0, seq as u64), ps);
        assert_eq!(
            pages.len(),
            touched.len(),
            "pass {seq}: file holds exactly the touched pages"
        );
        let mut expected: Vec<Vec<u8>> = touched
            .iter()
            .map(|index| common::stamped_page(*index, ps))
            .collect();
        pages.sort();
        expected.sort();
        assert_eq!(pages, expected, "pass {seq}");
    }
}
