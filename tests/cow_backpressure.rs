//! The COW pool is a hard bound: allocations in flight never exceed the slot
//! count, and overflow falls back to the WAIT path instead of growing memory.

mod common;

use blobcr::config::CheckpointConfig;
use blobcr::runtime;
use blobcr::transport::LocalGroup;

#[test]
fn cow_allocations_never_exceed_the_pool() {
    let dir = common::scratch();
    let page_size = region::page::size();
    // Exactly two COW slots.
    let cow_bits = (2 * page_size).trailing_zeros();
    let handle = runtime::start_with(
        CheckpointConfig::default()
            .with_path_prefix(dir.path())
            .with_cow_size_bits(cow_bits),
        LocalGroup::solo(),
    )
    .expect("start");
    let ps = handle.page_size();

    let pages = 2048;
    let buf = common::Protected::alloc(&handle, pages * ps);
    buf.data().fill(1);

    handle.checkpoint().expect("checkpoint");
    // Touch ten pages spread across the buffer while the writer drains.
    let touched = 10;
    for index in 0..touched {
        buf.data()[index * (pages / touched) * ps] = 2;
    }
    handle.wait_for_checkpoint();

    let stats = handle.stats();
    assert!(
        stats.pages_cow <= 2,
        "cow count {} exceeded the two-slot pool",
        stats.pages_cow
    );
    // Writes reaching a page the writer had already committed and reopened
    // do not trap, so the counters are bounded by the touch count.
    assert!(
        stats.pages_cow + stats.pages_wait + stats.pages_after + stats.pages_delayed
            <= touched as u64
    );

    let image = std::fs::read(common::ckpt_path(dir.path(), 0, 0)).expect("ckpt file");
    assert_eq!(image.len(), pages * ps);
}
