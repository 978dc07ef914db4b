//! Content-addressed page filtering.
//!
//! Each candidate page is keyed by a 160-bit SHA-1 digest. Locally, only the
//! first page carrying a given digest survives. Globally, all ranks reduce
//! their digest sets into the top-K most frequent entries, each annotated
//! with an owner rank list (up to the replication factor, ordered for load
//! balance); a rank keeps a page only when it appears in that list, so every
//! retained digest is written by exactly one rank and replicated by the rest
//! of its list.

mod merge;

pub use merge::merge_sets;

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::transport::{self, Collective, Rank, TransportError};

/// Digest width in bytes (SHA-1).
pub const HASH_SIZE: usize = 20;

/// Global reduction keeps the 2^17 most frequent digests; trimming at every
/// pairwise merge bounds the in-flight set regardless of working-set size.
pub const TOP_K: usize = 1 << 17;

/// 160-bit content digest of one page.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageDigest(pub [u8; HASH_SIZE]);

impl PageDigest {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for PageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…")
    }
}

/// One digest's standing in the global reduction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEntry {
    pub digest: PageDigest,
    /// Global frequency: how many pages across all ranks carry this content.
    pub count: u32,
    /// Owning ranks, preference-ordered; index 0 writes, the rest replicate.
    pub ranks: Vec<Rank>,
}

/// Dedup counters; summed across ranks for the cycle log line.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DedupStats {
    /// Pages submitted this cycle.
    pub total: u32,
    /// Distinct digests after local filtering.
    pub local: u32,
    /// Digests retained after the global reduction.
    pub global: u32,
}

/// Per-rank dedup engine; cleared and refilled every checkpoint cycle.
pub struct DedupEngine {
    rank: Rank,
    /// Rank-list capacity: the replication factor, floored at one owner.
    rank_cap: usize,
    entries: FxHashMap<PageDigest, usize>,
    retained: FxHashMap<usize, bool>,
    owners: FxHashMap<usize, Vec<Rank>>,
    stats: DedupStats,
}

impl DedupEngine {
    pub fn new(rank: Rank, replication_factor: u32) -> Self {
        Self {
            rank,
            rank_cap: replication_factor.max(1) as usize,
            entries: FxHashMap::default(),
            retained: FxHashMap::default(),
            owners: FxHashMap::default(),
            stats: DedupStats::default(),
        }
    }

    /// Forgets the previous cycle.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.retained.clear();
        self.owners.clear();
        self.stats = DedupStats::default();
    }

    /// Submits one candidate page. The first page seen with a given digest
    /// becomes the representative; later duplicates are filtered out.
    pub fn process_page(&mut self, addr: usize, bytes: &[u8]) {
        let digest = PageDigest::of(bytes);
        self.stats.total += 1;
        match self.entries.entry(digest) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(addr);
                self.retained.insert(addr, true);
            }
            std::collections::hash_map::Entry::Occupied(_) => {
                self.retained.insert(addr, false);
            }
        }
    }

    /// Whether `addr` survived dedup and must be written by this rank.
    pub fn check_page(&self, addr: usize) -> bool {
        self.retained.get(&addr).copied().unwrap_or(false)
    }

    /// Owner rank list recorded for `addr` by the global reduction, if any.
    pub fn owner_ranks(&self, addr: usize) -> Option<&[Rank]> {
        self.owners.get(&addr).map(Vec::as_slice)
    }

    /// Closes the local pass.
    pub fn finalize_local(&mut self) {
        self.stats.local = self.entries.len() as u32;
    }

    /// All-to-all reduction converging on the global top-K digest set.
    ///
    /// Afterwards a page stays retained only if its digest survived the
    /// reduction with this rank in the owner list; the list itself is kept
    /// for the replication engine.
    pub fn global_dedup(&mut self, group: &dyn Collective) -> Result<(), TransportError> {
        let n_ranks = group.size() as usize;
        let rank_cap = self.rank_cap;
        let local_set: Vec<HashEntry> = self
            .entries
            .keys()
            .map(|digest| HashEntry {
                digest: *digest,
                count: 1,
                ranks: vec![self.rank],
            })
            .collect();

        let merged = transport::all_reduce_typed(group, &local_set, |x, y| {
            merge_sets(n_ranks, rank_cap, x, y)
        })?;
        let merged: FxHashMap<PageDigest, HashEntry> = merged
            .into_iter()
            .map(|entry| (entry.digest, entry))
            .collect();

        let mut kept = 0;
        for (digest, addr) in &self.entries {
            let winner = merged
                .get(digest)
                .filter(|entry| entry.ranks.contains(&self.rank));
            match winner {
                Some(entry) => {
                    kept += 1;
                    self.owners.insert(*addr, entry.ranks.clone());
                }
                None => {
                    self.retained.insert(*addr, false);
                }
            }
        }
        self.stats.global = kept;

        if group.rank() == 0 {
            let mut histogram = vec![0u32; n_ranks];
            for entry in merged.values() {
                let bucket = (entry.count as usize).min(n_ranks) - 1;
                histogram[bucket] += 1;
            }
            for (frequency, hashes) in histogram.iter().enumerate() {
                debug!(
                    frequency = frequency + 1,
                    hashes, "global digest frequency"
                );
            }
        }
        Ok(())
    }

    /// This rank's counters.
    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    /// Counters summed over the whole group.
    pub fn reduced_stats(&self, group: &dyn Collective) -> Result<DedupStats, TransportError> {
        transport::all_reduce_typed(group, &self.stats, |a, b| DedupStats {
            total: a.total + b.total,
            local: a.local + b.local,
            global: a.global + b.global,
        })
    }
}
