use std::cmp::Reverse;

use rustc_hash::FxHashMap;

use super::{HashEntry, PageDigest, TOP_K};

/// Pairwise merge of two digest sets for the global all-reduce.
///
/// Associative and commutative: entries unique to either side are carried
/// over, entries present in both sum their counts and merge their owner rank
/// lists ordered by ascending assignment load (ties prefer the larger rank
/// index), truncated to `rank_cap`. The result is trimmed to the [`TOP_K`]
/// most frequent digests at every merge so intermediate sets stay bounded.
///
/// All iteration happens in sorted digest order, so every rank folding the
/// same deposits produces the same bytes.
pub fn merge_sets(
    n_ranks: usize,
    rank_cap: usize,
    x: Vec<HashEntry>,
    y: Vec<HashEntry>,
) -> Vec<HashEntry> {
    let mut load = vec![0u32; n_ranks];
    let x_index: FxHashMap<PageDigest, usize> = x
        .iter()
        .enumerate()
        .map(|(i, e)| (e.digest, i))
        .collect();
    let y_index: FxHashMap<PageDigest, usize> = y
        .iter()
        .enumerate()
        .map(|(i, e)| (e.digest, i))
        .collect();

    let mut x_sorted: Vec<&HashEntry> = x.iter().collect();
    x_sorted.sort_unstable_by_key(|e| e.digest);
    let mut y_sorted: Vec<&HashEntry> = y.iter().collect();
    y_sorted.sort_unstable_by_key(|e| e.digest);

    let mut result: Vec<HashEntry> = Vec::with_capacity(x.len() + y.len());

    for entry in &x_sorted {
        if !y_index.contains_key(&entry.digest) {
            bump(&mut load, &entry.ranks);
            result.push((*entry).clone());
        }
    }
    for entry in &y_sorted {
        if !x_index.contains_key(&entry.digest) {
            bump(&mut load, &entry.ranks);
            result.push((*entry).clone());
        }
    }
    for entry in &y_sorted {
        let Some(&xi) = x_index.get(&entry.digest) else {
            continue;
        };
        let twin = &x[xi];
        let mut ranks: Vec<_> = twin
            .ranks
            .iter()
            .chain(entry.ranks.iter())
            .copied()
            .collect();
        ranks.sort_unstable();
        ranks.dedup();
        ranks.sort_by_key(|r| (load[*r as usize], Reverse(*r)));
        ranks.truncate(rank_cap);
        bump(&mut load, &ranks);
        result.push(HashEntry {
            digest: entry.digest,
            count: twin.count + entry.count,
            ranks,
        });
    }

    result.sort_unstable_by_key(|e| (Reverse(e.count), Reverse(e.digest)));
    result.truncate(TOP_K);
    result
}

fn bump(load: &mut [u32], ranks: &[u32]) {
    for rank in ranks {
        load[*rank as usize] += 1;
    }
}
