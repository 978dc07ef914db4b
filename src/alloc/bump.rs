use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use region::{Allocation, Protection};

use super::AllocError;

/// Monotonic metadata arena over one anonymous mapping.
///
/// Allocation is a lock-free atomic bump, safe to call from the signal
/// handler; there is no free. Everything carved out of the arena lives until
/// the pool itself is dropped, which matches the lifetime of the manager that
/// owns it.
pub struct BumpPool {
    slab: Allocation,
    base: usize,
    next: AtomicUsize,
}

// SAFETY: the backing mapping is owned by the pool for its whole lifetime and
// handed out in disjoint chunks guarded by the atomic cursor.
unsafe impl Send for BumpPool {}
unsafe impl Sync for BumpPool {}

impl BumpPool {
    /// Default arena capacity: 2^29 bytes (512 MiB).
    pub const DEFAULT_CAPACITY: usize = 1 << 29;

    /// Reserves `capacity` bytes of anonymous read-write memory.
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        let slab = region::alloc(capacity, Protection::READ_WRITE).map_err(|source| {
            AllocError::Map {
                pool: "bump",
                requested: capacity,
                source,
            }
        })?;
        let base = slab.as_ptr::<u8>() as usize;
        Ok(Self {
            slab,
            base,
            next: AtomicUsize::new(0),
        })
    }

    /// Carves `size` bytes aligned to `align` out of the arena.
    ///
    /// Returns `None` once the reserved capacity is gone; callers treat that
    /// as fatal (the arena is sized so that it never happens in practice).
    pub fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let cap = self.slab.len();
        let mut offset = 0;
        let claimed = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let aligned = (self.base + cur + align - 1) & !(align - 1);
                offset = aligned - self.base;
                offset.checked_add(size).filter(|end| *end <= cap)
            })
            .is_ok();
        if !claimed {
            return None;
        }
        NonNull::new((self.base + offset) as *mut u8)
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }

    /// Total reserved capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.slab.len()
    }

    /// Remaining bytes, ignoring alignment padding of future requests.
    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_is_monotonic_and_aligned() {
        let pool = BumpPool::new(1 << 16).expect("mapping");
        let a = pool.alloc(100, 8).expect("first");
        let b = pool.alloc(100, 8).expect("second");
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 100);
        assert_eq!(a.as_ptr() as usize % 8, 0);
        assert_eq!(b.as_ptr() as usize % 8, 0);
    }

    #[test]
    fn bump_exhausts_instead_of_growing() {
        let pool = BumpPool::new(1 << 12).expect("mapping");
        assert!(pool.alloc(1 << 12, 1).is_some());
        assert!(pool.alloc(1, 1).is_none());
    }

    #[test]
    fn bump_survives_concurrent_allocation() {
        use std::sync::Arc;

        let pool = Arc::new(BumpPool::new(1 << 20).expect("mapping"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let mut ptrs = Vec::new();
                for _ in 0..64 {
                    ptrs.push(pool.alloc(128, 16).expect("alloc").as_ptr() as usize);
                }
                ptrs
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread"))
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4 * 64, "allocations must be disjoint");
    }
}
