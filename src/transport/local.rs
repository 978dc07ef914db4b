use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use super::{Collective, MergeFn, Rank, TransportError};

/// In-process rank group.
///
/// Endpoints share one rendezvous: flume lanes for point-to-point traffic, a
/// deposit board for gather/reduce, and a window registry whose puts copy
/// straight into the target rank's registered mapping. Collectives
/// synchronize on a reusable [`Barrier`], so every rank must issue the same
/// call sequence, the same discipline a real communicator imposes.
pub struct LocalGroup;

impl LocalGroup {
    /// Builds an `n`-rank group; endpoint `i` belongs to rank `i`.
    pub fn new(n: Rank) -> Vec<LocalCollective> {
        assert!(n > 0, "a group needs at least one rank");
        let shared = Arc::new(GroupShared {
            n,
            barrier: Barrier::new(n as usize),
            board: Mutex::new(vec![None; n as usize]),
            windows: Mutex::new(vec![None; n as usize]),
        });

        // One lane per ordered (sender, receiver) pair.
        let mut lanes: Vec<Vec<_>> = (0..n)
            .map(|_| {
                (0..n)
                    .map(|_| flume::unbounded::<Vec<u8>>())
                    .map(|(tx, rx)| (Some(tx), Some(rx)))
                    .collect()
            })
            .collect();

        (0..n)
            .map(|rank| {
                let outbox = (0..n)
                    .map(|dst| lanes[rank as usize][dst as usize].0.take().expect("lane"))
                    .collect();
                let inbox = (0..n)
                    .map(|src| lanes[src as usize][rank as usize].1.take().expect("lane"))
                    .collect();
                LocalCollective {
                    rank,
                    shared: Arc::clone(&shared),
                    outbox,
                    inbox,
                }
            })
            .collect()
    }

    /// The single-rank endpoint used by `start_checkpointer`.
    pub fn solo() -> Arc<LocalCollective> {
        Arc::new(Self::new(1).pop().expect("one endpoint"))
    }
}

struct GroupShared {
    n: Rank,
    barrier: Barrier,
    /// All-gather deposit board, one slot per rank.
    board: Mutex<Vec<Option<Vec<u8>>>>,
    windows: Mutex<Vec<Option<WindowSlot>>>,
}

#[derive(Clone, Copy)]
struct WindowSlot {
    base: usize,
    len: usize,
}

/// One rank's endpoint of a [`LocalGroup`].
pub struct LocalCollective {
    rank: Rank,
    shared: Arc<GroupShared>,
    outbox: Vec<flume::Sender<Vec<u8>>>,
    inbox: Vec<flume::Receiver<Vec<u8>>>,
}

impl Collective for LocalCollective {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> Rank {
        self.shared.n
    }

    fn barrier(&self) -> Result<(), TransportError> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn send(&self, peer: Rank, payload: Vec<u8>) -> Result<(), TransportError> {
        self.outbox
            .get(peer as usize)
            .ok_or(TransportError::Unreachable { peer })?
            .send(payload)
            .map_err(|_| TransportError::Unreachable { peer })
    }

    fn recv(&self, peer: Rank) -> Result<Vec<u8>, TransportError> {
        self.inbox
            .get(peer as usize)
            .ok_or(TransportError::Unreachable { peer })?
            .recv()
            .map_err(|_| TransportError::Unreachable { peer })
    }

    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
        lock(&self.shared.board)[self.rank as usize] = Some(payload);
        // Deposit phase done everywhere before anyone reads.
        self.shared.barrier.wait();
        let gathered: Vec<Vec<u8>> = lock(&self.shared.board)
            .iter()
            .map(|slot| slot.clone().expect("every rank deposited"))
            .collect();
        // Hold the slots live until every rank has copied them out.
        self.shared.barrier.wait();
        Ok(gathered)
    }

    fn all_reduce(&self, payload: Vec<u8>, merge: MergeFn) -> Result<Vec<u8>, TransportError> {
        // Fold in ascending rank order on every rank: the merge is
        // associative and commutative, and a fixed order keeps the result
        // bit-identical everywhere.
        let mut deposits = self.all_gather(payload)?.into_iter();
        let first = deposits.next().expect("group is non-empty");
        deposits.try_fold(first, |acc, next| merge(acc, next))
    }

    fn win_open(&self, base: *mut u8, len: usize) -> Result<(), TransportError> {
        lock(&self.shared.windows)[self.rank as usize] = Some(WindowSlot {
            base: base as usize,
            len,
        });
        self.shared.barrier.wait();
        Ok(())
    }

    fn put(&self, peer: Rank, offset: usize, bytes: &[u8]) -> Result<(), TransportError> {
        let windows = lock(&self.shared.windows);
        let slot = windows
            .get(peer as usize)
            .copied()
            .ok_or(TransportError::Unreachable { peer })?
            .ok_or(TransportError::NoWindow { peer })?;
        if offset + bytes.len() > slot.len {
            return Err(TransportError::PutOutOfRange {
                peer,
                offset,
                len: bytes.len(),
                size: slot.len,
            });
        }
        // SAFETY: the target registered [base, base+len) as writable window
        // memory for the duration of the epoch; the registry lock is held
        // across the copy, so the window cannot close mid-put.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (slot.base + offset) as *mut u8,
                bytes.len(),
            );
        }
        Ok(())
    }

    fn fence(&self) -> Result<(), TransportError> {
        // Puts are synchronous copies here; the fence only has to order
        // epochs across ranks.
        self.shared.barrier.wait();
        Ok(())
    }

    fn win_close(&self) -> Result<(), TransportError> {
        self.shared.barrier.wait();
        lock(&self.shared.windows)[self.rank as usize] = None;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
