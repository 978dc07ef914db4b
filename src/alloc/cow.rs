use std::ptr::NonNull;
use std::sync::Mutex;

use region::{Allocation, Protection};

use super::{AllocError, BumpPool};

/// Bounded pool of page-sized copy-on-write slots.
///
/// The slab holds `capacity` slots carved from one anonymous mapping; the
/// occupancy bitmap lives in the metadata arena. Allocation is a first-free
/// linear sweep. The pool never grows: when it is empty the fault handler
/// falls back to waiting on the writer, which is the intended back-pressure.
pub struct CowPool {
    /// Keeps the slot mapping alive for the pool's lifetime.
    _slab: Option<Allocation>,
    base: usize,
    page_size: usize,
    capacity: usize,
    state: Mutex<SlotState>,
}

struct SlotState {
    /// One occupancy byte per slot, allocated from the bump arena.
    bitmap: *mut u8,
    in_flight: usize,
}

// SAFETY: the slab and bitmap are owned for the pool's lifetime; the bitmap
// and slot handout are only touched under `state`.
unsafe impl Send for CowPool {}
unsafe impl Sync for CowPool {}

impl CowPool {
    /// Builds a pool of `pool_bytes / page_size` slots.
    ///
    /// A zero-sized pool is legal: every allocation fails and the WAIT path
    /// absorbs all mid-checkpoint writes.
    pub fn new(page_size: usize, pool_bytes: usize, meta: &BumpPool) -> Result<Self, AllocError> {
        let capacity = pool_bytes / page_size;
        let slab = if capacity > 0 {
            Some(
                region::alloc(capacity * page_size, Protection::READ_WRITE).map_err(|source| {
                    AllocError::Map {
                        pool: "cow",
                        requested: capacity * page_size,
                        source,
                    }
                })?,
            )
        } else {
            None
        };
        let base = slab.as_ref().map_or(0, |s| s.as_ptr::<u8>() as usize);
        let bitmap = if capacity > 0 {
            let ptr = meta.alloc(capacity, 1).ok_or(AllocError::Exhausted {
                pool: "bump",
                requested: capacity,
                remaining: meta.remaining(),
            })?;
            // SAFETY: freshly carved from the arena, exclusively ours.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, capacity) };
            ptr.as_ptr()
        } else {
            std::ptr::null_mut()
        };
        Ok(Self {
            _slab: slab,
            base,
            page_size,
            capacity,
            state: Mutex::new(SlotState {
                bitmap,
                in_flight: 0,
            }),
        })
    }

    /// Claims the first free slot, or `None` when the pool is drained.
    pub fn alloc_slot(&self) -> Option<NonNull<u8>> {
        if self.capacity == 0 {
            return None;
        }
        let mut state = lock(&self.state);
        for index in 0..self.capacity {
            // SAFETY: bitmap has `capacity` bytes and is guarded by `state`.
            let flag = unsafe { state.bitmap.add(index) };
            if unsafe { *flag } == 0 {
                unsafe { *flag = 1 };
                state.in_flight += 1;
                return NonNull::new((self.base + index * self.page_size) as *mut u8);
            }
        }
        None
    }

    /// Returns a slot claimed by [`alloc_slot`](Self::alloc_slot).
    pub fn free_slot(&self, slot: NonNull<u8>) {
        let addr = slot.as_ptr() as usize;
        if self.capacity == 0 || addr < self.base {
            return;
        }
        let index = (addr - self.base) / self.page_size;
        if index >= self.capacity {
            return;
        }
        let mut state = lock(&self.state);
        // SAFETY: index bounds-checked above; guarded by `state`.
        unsafe { *state.bitmap.add(index) = 0 };
        state.in_flight -= 1;
    }

    /// Number of slots in the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently handed out.
    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
