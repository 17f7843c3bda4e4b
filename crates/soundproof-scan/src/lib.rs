//! Plugin scanning: candidate discovery, per-file isolated scans, and the
//! newline-delimited JSON record grammar shared with the client-side
//! reader.
//!
//! The scanner binary (`soundproof-scanner`) runs in two modes. With no
//! `--file` it walks the search paths, reports every candidate plugin file,
//! and spawns *itself* in single-file mode per candidate so a plugin whose
//! `init` or `activate` takes the process down only loses that one file's
//! scan. With `--file` it loads the file and enumerates its plugins for
//! real.

pub mod paths;
pub mod record;
pub mod scan;

pub use record::ScanRecord;

/// Scan-related errors
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
