//! Error types for s-tar

use std::io;
use std::path::{Path, PathBuf};

/// Result type for s-tar operations
pub type Result<T> = std::result::Result<T, STarError>;

/// Process exit codes used by the `s-tar` binary, one per failure class so
/// calling scripts can branch on them.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const INVALID_INPUT: u8 = 2;
    pub const CODEC_UNAVAILABLE: u8 = 3;
    pub const IO_FAILURE: u8 = 4;
    pub const INTEGRITY: u8 = 5;
    pub const CANCELLED: u8 = 130;
}

/// Error types that can occur while building, moving or extracting an archive stream
#[derive(Debug, thiserror::Error)]
pub enum STarError {
    /// The requested algorithm was not compiled into this build
    #[error("{algorithm} compression is not available (enable the `{feature}` feature)")]
    CodecUnavailable {
        algorithm: &'static str,
        feature: &'static str,
    },

    /// Chunked input has no manifest next to its parts
    #[error("chunk manifest not found: {}", .path.display())]
    ManifestMissing { path: PathBuf },

    /// A part listed in the manifest does not exist
    #[error("chunk {index} is missing: {}", .path.display())]
    ChunkMissing { index: u32, path: PathBuf },

    /// A part does not match the size or checksum recorded in the manifest
    #[error("chunk {index} is corrupt: expected {expected}, found {actual}")]
    ChunkCorrupt {
        index: u32,
        expected: String,
        actual: String,
    },

    /// No known signature matched the leading bytes of the archive
    #[error("unrecognized archive format")]
    FormatUnrecognized,

    /// The run was cancelled by the user, or aborted by a second interrupt
    #[error("{}", cancel_message(.forced))]
    Cancelled { forced: bool },

    /// Underlying filesystem or stream failure
    #[error("{op} failed{}: {source}", path_suffix(.path))]
    Io {
        op: &'static str,
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },

    /// One side of the pipeline stopped after bytes were already emitted
    #[error("partial write: {0}")]
    PartialWrite(String),

    /// Malformed manifest, encoded payload or archive stream
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Options that cannot describe a valid run
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Extraction target exists and the overwrite policy forbids replacing it
    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),
}

fn cancel_message(forced: &bool) -> &'static str {
    if *forced {
        "operation aborted"
    } else {
        "operation cancelled"
    }
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" for '{}'", p.display()))
        .unwrap_or_default()
}

impl STarError {
    /// Exit code a command surface should return for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            STarError::CodecUnavailable { .. } => exit_code::CODEC_UNAVAILABLE,
            STarError::ManifestMissing { .. }
            | STarError::ChunkMissing { .. }
            | STarError::ChunkCorrupt { .. } => exit_code::INTEGRITY,
            STarError::Cancelled { .. } => exit_code::CANCELLED,
            STarError::Io { .. } | STarError::PartialWrite(_) => exit_code::IO_FAILURE,
            STarError::FormatUnrecognized
            | STarError::InvalidFormat(_)
            | STarError::InvalidOptions(_) => exit_code::INVALID_INPUT,
            STarError::DestinationExists(_) => exit_code::FAILURE,
        }
    }

    /// True for manifest and chunk integrity failures
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            STarError::ManifestMissing { .. }
                | STarError::ChunkMissing { .. }
                | STarError::ChunkCorrupt { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, STarError::Cancelled { .. })
    }

    pub(crate) fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        STarError::Io {
            op,
            path: Some(path.as_ref().to_path_buf()),
            source,
        }
    }

    /// I/O failure on a stream that has no path
    pub(crate) fn stream(op: &'static str, source: io::Error) -> Self {
        STarError::Io {
            op,
            path: None,
            source,
        }
    }
}

impl From<io::Error> for STarError {
    fn from(err: io::Error) -> Self {
        STarError::Io {
            op: "i/o",
            path: None,
            source: err,
        }
    }
}

/// Attach the failing operation and path to an `io::Result`
pub(crate) trait IoContext<T> {
    fn io_ctx(self, op: &'static str, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_ctx(self, op: &'static str, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| STarError::io(op, path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_class() {
        let codes = [
            STarError::CodecUnavailable {
                algorithm: "zstd",
                feature: "zstd-support",
            }
            .exit_code(),
            STarError::Cancelled { forced: false }.exit_code(),
            STarError::from(io::Error::other("disk")).exit_code(),
            STarError::ChunkCorrupt {
                index: 0,
                expected: "a".into(),
                actual: "b".into(),
            }
            .exit_code(),
        ];
        let mut unique = codes.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
        assert!(!codes.contains(&exit_code::SUCCESS));
    }

    #[test]
    fn test_io_context_names_path() {
        let err: Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
            .io_ctx("open source", "/tmp/missing.txt");
        let msg = err.unwrap_err().to_string();
        assert!(msg.contains("open source"));
        assert!(msg.contains("/tmp/missing.txt"));
    }

    #[test]
    fn test_integrity_classification() {
        assert!(STarError::ManifestMissing {
            path: PathBuf::from("x.metadata")
        }
        .is_integrity());
        assert!(!STarError::FormatUnrecognized.is_integrity());
        assert!(STarError::Cancelled { forced: true }.is_cancelled());
    }
}
