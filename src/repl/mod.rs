//! Replication engine: pushes retained pages to *k−1* peers.
//!
//! Placement is recomputed per checkpoint cycle. Every rank contributes its
//! per-slot outbound load through an all-gather, a shuffle permutation
//! interleaves heavy and light senders so no receiver is bandwidth-starved,
//! and each rank maps a replica file sized for its inbound traffic as a
//! one-sided remote-memory window. The writer then streams every committed
//! page into its remaining peer slots; one fence at finalize completes the
//! epoch.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::transport::{self, Collective, Rank, TransportError};

/// Stride between a rank and its first replica peer in shuffled space.
pub const RANK_DISTANCE: u32 = 1;

/// Errors raised while standing up or tearing down a replica window.
#[derive(Debug, Error)]
pub enum ReplError {
    #[error("replica file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to map {len} bytes of replica file {path}")]
    Map { path: PathBuf, len: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-cycle replica placement and window state.
pub struct ReplEngine {
    rep: u32,
    page_size: usize,
    /// `send_peers[j]`/`recv_peers[j]` for slot `j` in `[1, rep)`; index 0 is
    /// this rank itself.
    send_peers: Vec<Rank>,
    recv_peers: Vec<Rank>,
    /// Next write offset into each send peer's window, in bytes.
    offsets: Vec<usize>,
    /// Residual copies per page address when global dedup assigned owner
    /// lists; pages absent from the map need the full `rep - 1` copies.
    residual: FxHashMap<usize, u32>,
    window: Option<ReplicaWindow>,
}

struct ReplicaWindow {
    file: std::fs::File,
    path: PathBuf,
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is owned by the engine; only the writer thread and
// fenced remote puts touch it.
unsafe impl Send for ReplEngine {}

impl ReplEngine {
    /// Computes this cycle's placement and opens the replica window.
    ///
    /// `load[j]` is the number of pages this rank will send on replica slot
    /// `j` (`load[0]` counts local writes). Collective: every rank of the
    /// group must call `init` once per cycle.
    pub fn init(
        group: &dyn Collective,
        rep: u32,
        page_size: usize,
        load: &[u32],
        dir: &Path,
        seq_no: u64,
        residual: FxHashMap<usize, u32>,
    ) -> Result<Self, ReplError> {
        let n = group.size();
        let rank = group.rank();
        let load_info = transport::all_gather_typed(group, &load.to_vec())?;

        let shuffled = shuffle_ranks(&load_info, rep);
        let pos = shuffled
            .iter()
            .position(|r| *r == rank)
            .expect("own rank is in the permutation");

        let mut send_peers = vec![rank; rep as usize];
        let mut recv_peers = vec![rank; rep as usize];
        let mut offsets = vec![0usize; rep as usize];
        let mut recv_pages = 0u64;
        for j in 1..rep as usize {
            let dist = j * RANK_DISTANCE as usize;
            send_peers[j] = shuffled[(pos + dist) % n as usize];
            recv_peers[j] = shuffled[(pos + n as usize * rep as usize - dist) % n as usize];
            recv_pages += u64::from(load_info[recv_peers[j] as usize][j]);
            for i in 1..j {
                offsets[j] += load_info[send_peers[i] as usize][j - i] as usize * page_size;
            }
        }
        let recv_size = recv_pages as usize * page_size;
        debug!(
            rank,
            seq_no,
            send = ?&send_peers[1..],
            recv = ?&recv_peers[1..],
            recv_size,
            "replication placement"
        );

        let window = if recv_size > 0 {
            Some(ReplicaWindow::create(
                dir.join(format!("blobcr-repl-{rank}-{seq_no}.dat")),
                recv_size,
            )?)
        } else {
            None
        };
        let (base, len) = window
            .as_ref()
            .map_or((std::ptr::null_mut(), 0), |w| (w.base, w.len));
        group.win_open(base, len)?;
        group.fence()?;

        Ok(Self {
            rep,
            page_size,
            send_peers,
            recv_peers,
            offsets,
            residual,
            window,
        })
    }

    /// Pushes one locally committed page into its remaining peer slots.
    ///
    /// Pages whose global owner list already covers some replicas need only
    /// the residual copies; completion is deferred to the finalize fence.
    pub fn replicate(
        &mut self,
        group: &dyn Collective,
        addr: usize,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let copies = self
            .residual
            .get(&addr)
            .copied()
            .unwrap_or(self.rep.saturating_sub(1));
        for slot in 1..=copies as usize {
            group.put(self.send_peers[slot], self.offsets[slot], bytes)?;
            self.offsets[slot] += self.page_size;
        }
        Ok(())
    }

    /// Fences the epoch, releases the window, and makes the replica durable.
    pub fn finalize(mut self, group: &dyn Collective) -> Result<(), ReplError> {
        group.fence()?;
        group.win_close()?;
        if let Some(window) = self.window.take() {
            window.sync_and_close()?;
        }
        Ok(())
    }

    /// Receive peer for each replica slot (slot 0 is this rank).
    pub fn recv_peers(&self) -> &[Rank] {
        &self.recv_peers
    }
}

impl ReplicaWindow {
    fn create(path: PathBuf, len: usize) -> Result<Self, ReplError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| ReplError::Io {
                path: path.clone(),
                source,
            })?;
        file.set_len(len as u64).map_err(|source| ReplError::Io {
            path: path.clone(),
            source,
        })?;
        // SAFETY: mapping a file we just created and sized; MAP_SHARED so
        // remote puts reach the page cache.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ReplError::Map { path, len });
        }
        Ok(Self {
            file,
            path,
            base: base.cast(),
            len,
        })
    }

    fn sync_and_close(self) -> Result<(), ReplError> {
        // SAFETY: unmapping the exact mapping created above.
        unsafe { libc::munmap(self.base.cast(), self.len) };
        // SAFETY: fd stays owned by `self.file` until drop below.
        let rc = unsafe { libc::fdatasync(self.file.as_raw_fd()) };
        if rc != 0 {
            return Err(ReplError::Io {
                path: self.path.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

/// Interleaves heavy and light senders.
///
/// Ranks sort by total outbound pages descending (ties: ascending rank, so
/// every rank computes the same permutation), then the permutation alternates
/// one sender from the heavy head with `rep − 1` from the light tail.
fn shuffle_ranks(load_info: &[Vec<u32>], rep: u32) -> Vec<Rank> {
    let n = load_info.len();
    let mut order: Vec<Rank> = (0..n as Rank).collect();
    let traffic = |rank: Rank| -> u64 {
        load_info[rank as usize]
            .iter()
            .skip(1)
            .map(|pages| u64::from(*pages))
            .sum()
    };
    order.sort_by_key(|rank| (std::cmp::Reverse(traffic(*rank)), *rank));

    let mut queue: VecDeque<Rank> = order.into();
    let mut shuffled = Vec::with_capacity(n);
    while let Some(heavy) = queue.pop_front() {
        shuffled.push(heavy);
        for _ in 1..rep.max(1) {
            if let Some(light) = queue.pop_back() {
                shuffled.push(light);
            }
        }
    }
    shuffled
}
