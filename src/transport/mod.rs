//! Group communication contract between checkpointing ranks.
//!
//! The engine needs an MPI-shaped substrate: point-to-point sends, a blocking
//! barrier, all-gather, a commutative all-reduce with a caller-supplied
//! associative merge, and one-sided puts into a registered remote-memory
//! window. [`Collective`] captures exactly that, byte-oriented so the trait
//! stays object-safe; typed payloads cross through the serde helpers below.
//!
//! [`LocalGroup`] is the in-process implementation used by the single-rank
//! default, the test suite, and the `dist_bench` harness. A binding to a real
//! interconnect implements the same trait.

mod local;

pub use local::{LocalCollective, LocalGroup};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// One participating process, identified by an integer in `[0, N)`.
pub type Rank = u32;

/// Errors surfaced by the transport. A failed collective is treated as a host
/// failure: the checkpoint cycle aborts and the manager returns to idle.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A peer endpoint is gone (its half of the group was dropped).
    #[error("rank {peer} is unreachable")]
    Unreachable { peer: Rank },

    /// A one-sided put targeted a rank with no open window.
    #[error("no remote window open on rank {peer}")]
    NoWindow { peer: Rank },

    /// A one-sided put fell outside the target window.
    #[error("put of {len} bytes at offset {offset} exceeds {size}-byte window on rank {peer}")]
    PutOutOfRange {
        peer: Rank,
        offset: usize,
        len: usize,
        size: usize,
    },

    /// A collective payload failed to encode or decode.
    #[error("collective payload codec failed: {source}")]
    Codec {
        #[from]
        source: serde_json::Error,
    },
}

/// Associative, commutative merge for [`Collective::all_reduce`].
pub type MergeFn<'a> = &'a (dyn Fn(Vec<u8>, Vec<u8>) -> Result<Vec<u8>, TransportError> + Sync);

/// Byte-oriented group communication, globally ordered per call-site.
///
/// Every rank must issue the same sequence of collective calls; the
/// implementations rendezvous by call order, exactly like MPI communicators.
pub trait Collective: Send + Sync {
    fn rank(&self) -> Rank;
    fn size(&self) -> Rank;

    /// Blocks until every rank has entered the barrier.
    fn barrier(&self) -> Result<(), TransportError>;

    /// Point-to-point send; ordering is only guaranteed per peer pair.
    fn send(&self, peer: Rank, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Receives the next payload sent by `peer`.
    fn recv(&self, peer: Rank) -> Result<Vec<u8>, TransportError>;

    /// Deposits `payload` and returns every rank's deposit, indexed by rank.
    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError>;

    /// Reduces all deposits with `merge`; every rank gets the same result.
    ///
    /// The merge must be associative and commutative so implementations are
    /// free to pick any reduction shape.
    fn all_reduce(&self, payload: Vec<u8>, merge: MergeFn) -> Result<Vec<u8>, TransportError>;

    /// Collectively registers `len` bytes at `base` as this rank's window.
    /// Ranks with nothing to receive register an empty window.
    fn win_open(&self, base: *mut u8, len: usize) -> Result<(), TransportError>;

    /// One-sided write into `peer`'s window. Completion is only guaranteed
    /// after the next [`fence`](Self::fence).
    fn put(&self, peer: Rank, offset: usize, bytes: &[u8]) -> Result<(), TransportError>;

    /// Collective fence: all puts issued before it are visible after it.
    fn fence(&self) -> Result<(), TransportError>;

    /// Collectively releases the window registered by `win_open`.
    fn win_close(&self) -> Result<(), TransportError>;
}

/// Serializes a typed collective payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserializes a typed collective payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Typed all-gather: every rank's `value`, indexed by rank.
pub fn all_gather_typed<T>(group: &dyn Collective, value: &T) -> Result<Vec<T>, TransportError>
where
    T: Serialize + DeserializeOwned,
{
    let raw = group.all_gather(encode(value)?)?;
    raw.iter().map(|bytes| decode(bytes)).collect()
}

/// Typed all-reduce over a caller-supplied merge.
pub fn all_reduce_typed<T, F>(
    group: &dyn Collective,
    value: &T,
    merge: F,
) -> Result<T, TransportError>
where
    T: Serialize + DeserializeOwned,
    F: Fn(T, T) -> T + Sync,
{
    let merged = group.all_reduce(encode(value)?, &|a, b| {
        encode(&merge(decode(&a)?, decode(&b)?))
    })?;
    decode(&merged)
}
