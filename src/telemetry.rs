//! Tracing setup and per-rank log routing.
//!
//! With `CKPT_LOG_PREFIX` unset everything goes to stderr. When it names a
//! directory, each rank writes `<prefix>/ckpt_messages-rank_<rank>.log`
//! instead, so collectively launched jobs do not interleave their output.
//! Verbosity follows `RUST_LOG` (default `info`).
//!
//! The subscriber is process-global; in-process multi-rank harnesses share it
//! and rely on the `rank` field every engine event carries.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::transport::Rank;

/// Shared file handle usable as a tracing writer.
#[derive(Clone)]
struct FileWriter(Arc<File>);

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

/// Installs the global subscriber. Safe to call more than once; later calls
/// are no-ops (the first writer wins, as with any global dispatcher).
pub fn init(log_prefix: Option<&Path>, rank: Rank) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_prefix.map(|dir| open_rank_log(dir, rank)) {
        Some(Ok(file)) => {
            let writer = FileWriter(Arc::new(file));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .try_init()
                .ok();
        }
        Some(Err(error)) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init()
                .ok();
            warn!(rank, %error, "could not open rank log file, using stderr");
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init()
                .ok();
        }
    }
}

fn open_rank_log(dir: &Path, rank: Rank) -> io::Result<File> {
    std::fs::create_dir_all(dir)?;
    File::create(dir.join(format!("ckpt_messages-rank_{rank}.log")))
}
