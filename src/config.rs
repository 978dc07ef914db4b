//! Environment-driven checkpointer configuration.
//!
//! Every knob arrives through environment variables (optionally seeded from a
//! `.env` file), matching how batch schedulers launch HPC jobs:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `CKPT_PATH_PREFIX` | directory for checkpoint and replica files | `/tmp` |
//! | `CKPT_LOG_PREFIX` | directory for per-rank log files | unset → stderr |
//! | `CKPT_MAX_COW_SIZE` | log₂ bytes of the COW pool | `27` (128 MiB) |
//! | `INCREMENTAL_FLAG` | only checkpoint pages touched since the last cycle | `false` |
//! | `ACCESS_ORDER_FLAG` | writer orders pages by recorded access kind | `false` |
//! | `DEDUP_FLAG` | drop duplicate page contents within a rank | `false` |
//! | `GLOBAL_DEDUP_FLAG` | coordinate dedup across ranks (needs `DEDUP_FLAG`) | `false` |
//! | `REPLICATION_FACTOR` | copies per retained page; `0`/`1`/invalid disables | `0` |
//!
//! Booleans are the case-insensitive string `true`; anything else is `false`.
//! Unparsable numerics fall back to their defaults; a misconfigured job
//! checkpoints conservatively instead of failing to start.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default COW pool size exponent: 2^27 bytes (128 MiB).
pub const DEFAULT_COW_SIZE_BITS: u32 = 27;

/// Resolved checkpointer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory receiving `blobcr-ckpt-*.dat` and `blobcr-repl-*.dat`.
    pub path_prefix: PathBuf,
    /// Directory for per-rank log files; `None` logs to stderr.
    pub log_prefix: Option<PathBuf>,
    /// log₂ of the COW pool size in bytes.
    pub cow_size_bits: u32,
    /// Track touched pages and checkpoint only those.
    pub incremental: bool,
    /// Writer orders pages by recorded access kind.
    pub access_order: bool,
    /// Local content dedup.
    pub dedup: bool,
    /// Cross-rank dedup; requires `dedup`.
    pub global_dedup: bool,
    /// Total copies per retained page (*k*); below 2 disables replication.
    pub replication_factor: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path_prefix: PathBuf::from("/tmp"),
            log_prefix: None,
            cow_size_bits: DEFAULT_COW_SIZE_BITS,
            incremental: false,
            access_order: false,
            dedup: false,
            global_dedup: false,
            replication_factor: 0,
        }
    }
}

impl CheckpointConfig {
    /// Reads the configuration from the process environment, after loading a
    /// `.env` file if one is present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolves the configuration through an arbitrary variable lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let dedup = flag(&get, "DEDUP_FLAG");
        let mut global_dedup = flag(&get, "GLOBAL_DEDUP_FLAG");
        if global_dedup && !dedup {
            warn!("GLOBAL_DEDUP_FLAG is set without DEDUP_FLAG; ignoring it");
            global_dedup = false;
        }
        Self {
            path_prefix: get("CKPT_PATH_PREFIX")
                .map(PathBuf::from)
                .unwrap_or(defaults.path_prefix),
            log_prefix: get("CKPT_LOG_PREFIX").map(PathBuf::from),
            cow_size_bits: get("CKPT_MAX_COW_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_COW_SIZE_BITS),
            incremental: flag(&get, "INCREMENTAL_FLAG"),
            access_order: flag(&get, "ACCESS_ORDER_FLAG"),
            dedup,
            global_dedup,
            replication_factor: get("REPLICATION_FACTOR")
                .and_then(|v| v.trim().parse().ok())
                .filter(|k| *k >= 1)
                .unwrap_or(0),
        }
    }

    /// COW pool size in bytes.
    pub fn cow_bytes(&self) -> usize {
        1usize << self.cow_size_bits
    }

    /// Whether replication is active (*k* ≥ 2; *k* = 1 means "local copy
    /// only" and behaves like disabled).
    pub fn is_replicated(&self) -> bool {
        self.replication_factor >= 2
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    pub fn with_cow_size_bits(mut self, bits: u32) -> Self {
        self.cow_size_bits = bits;
        self
    }

    pub fn with_incremental(mut self, on: bool) -> Self {
        self.incremental = on;
        self
    }

    pub fn with_access_order(mut self, on: bool) -> Self {
        self.access_order = on;
        self
    }

    pub fn with_dedup(mut self, local: bool, global: bool) -> Self {
        self.dedup = local;
        self.global_dedup = global && local;
        self
    }

    pub fn with_replication_factor(mut self, k: u32) -> Self {
        self.replication_factor = k;
        self
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, name: &str) -> bool {
    get(name).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn defaults_match_the_documented_table() {
        let cfg = CheckpointConfig::from_lookup(|_| None);
        assert_eq!(cfg.path_prefix, PathBuf::from("/tmp"));
        assert!(cfg.log_prefix.is_none());
        assert_eq!(cfg.cow_size_bits, 27);
        assert!(!cfg.incremental && !cfg.access_order);
        assert!(!cfg.dedup && !cfg.global_dedup);
        assert_eq!(cfg.replication_factor, 0);
        assert!(!cfg.is_replicated());
    }

    #[test]
    fn booleans_are_case_insensitive() {
        let cfg = CheckpointConfig::from_lookup(lookup(&[
            ("INCREMENTAL_FLAG", "TRUE"),
            ("ACCESS_ORDER_FLAG", "True"),
            ("DEDUP_FLAG", "yes"),
        ]));
        assert!(cfg.incremental);
        assert!(cfg.access_order);
        assert!(!cfg.dedup, "only the literal word true counts");
    }

    #[test]
    fn global_dedup_requires_local_dedup() {
        let cfg = CheckpointConfig::from_lookup(lookup(&[("GLOBAL_DEDUP_FLAG", "true")]));
        assert!(!cfg.global_dedup);

        let cfg = CheckpointConfig::from_lookup(lookup(&[
            ("DEDUP_FLAG", "true"),
            ("GLOBAL_DEDUP_FLAG", "true"),
        ]));
        assert!(cfg.dedup && cfg.global_dedup);
    }

    #[test]
    fn invalid_replication_factor_disables_replication() {
        for value in ["0", "-3", "banana", ""] {
            let cfg = CheckpointConfig::from_lookup(lookup(&[("REPLICATION_FACTOR", value)]));
            assert_eq!(cfg.replication_factor, 0, "value {value:?}");
        }
        let cfg = CheckpointConfig::from_lookup(lookup(&[("REPLICATION_FACTOR", "1")]));
        assert_eq!(cfg.replication_factor, 1);
        assert!(!cfg.is_replicated(), "k = 1 keeps only the local copy");
        let cfg = CheckpointConfig::from_lookup(lookup(&[("REPLICATION_FACTOR", "2")]));
        assert!(cfg.is_replicated());
    }

    #[test]
    fn cow_size_parses_and_falls_back() {
        let cfg = CheckpointConfig::from_lookup(lookup(&[("CKPT_MAX_COW_SIZE", "13")]));
        assert_eq!(cfg.cow_bytes(), 8192);
        let cfg = CheckpointConfig::from_lookup(lookup(&[("CKPT_MAX_COW_SIZE", "big")]));
        assert_eq!(cfg.cow_size_bits, 27);
    }
}
