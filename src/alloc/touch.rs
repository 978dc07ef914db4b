use std::sync::Arc;

use super::{AllocError, BumpPool};

const FIRST_SEGMENT: usize = 1024;

/// Append-only record list with bump-arena storage.
///
/// The fault handler appends one record per serviced fault, so the backing
/// store must never go through the global heap. Segments come from the
/// [`BumpPool`]; growth copies into a doubled segment and abandons the old one
/// (the arena never reclaims anyway). Callers serialize access through the
/// page-table lock.
pub struct TouchLog<T: Copy> {
    meta: Arc<BumpPool>,
    seg: *mut T,
    len: usize,
    cap: usize,
}

// SAFETY: the segment is exclusively owned by the log; the log itself is only
// reached under the page-table mutex.
unsafe impl<T: Copy + Send> Send for TouchLog<T> {}

impl<T: Copy> TouchLog<T> {
    pub fn new(meta: Arc<BumpPool>) -> Self {
        Self {
            meta,
            seg: std::ptr::null_mut(),
            len: 0,
            cap: 0,
        }
    }

    /// Appends a record, growing into a fresh arena segment when full.
    pub fn push(&mut self, record: T) -> Result<(), AllocError> {
        if self.len == self.cap {
            self.grow()?;
        }
        // SAFETY: len < cap after grow; segment holds cap records.
        unsafe { self.seg.add(self.len).write(record) };
        self.len += 1;
        Ok(())
    }

    /// Copies the accumulated records out and restarts the log in place.
    pub fn snapshot_and_reset(&mut self) -> Vec<T> {
        if self.len == 0 {
            return Vec::new();
        }
        // SAFETY: the first `len` records of the segment are initialized.
        let out = unsafe { std::slice::from_raw_parts(self.seg, self.len) }.to_vec();
        self.len = 0;
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn grow(&mut self) -> Result<(), AllocError> {
        let new_cap = if self.cap == 0 {
            FIRST_SEGMENT
        } else {
            self.cap * 2
        };
        let bytes = new_cap * size_of::<T>();
        let seg = self
            .meta
            .alloc(bytes, align_of::<T>())
            .ok_or(AllocError::Exhausted {
                pool: "bump",
                requested: bytes,
                remaining: self.meta.remaining(),
            })?
            .as_ptr() as *mut T;
        if self.len > 0 {
            // SAFETY: disjoint segments, `len` initialized records.
            unsafe { std::ptr::copy_nonoverlapping(self.seg, seg, self.len) };
        }
        self.seg = seg;
        self.cap = new_cap;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_snapshot_round_trip() {
        let meta = Arc::new(BumpPool::new(1 << 20).expect("arena"));
        let mut log = TouchLog::new(meta);
        for i in 0..3000usize {
            log.push((i, i as u8)).expect("push");
        }
        assert_eq!(log.len(), 3000);

        let snap = log.snapshot_and_reset();
        assert_eq!(snap.len(), 3000);
        assert_eq!(snap[0], (0, 0));
        assert_eq!(snap[2999], (2999, (2999 % 256) as u8));
        assert!(log.is_empty());

        log.push((7, 7)).expect("push after reset");
        assert_eq!(log.snapshot_and_reset(), vec![(7, 7)]);
    }

    #[test]
    fn exhausted_arena_reports_instead_of_panicking() {
        let meta = Arc::new(BumpPool::new(1 << 12).expect("arena"));
        let mut log: TouchLog<[u8; 64]> = TouchLog::new(meta);
        let mut result = Ok(());
        for _ in 0..1 << 9 {
            result = log.push([0; 64]);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(AllocError::Exhausted { .. })));
    }
}
