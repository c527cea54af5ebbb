//! Per-run counters, serializable for `--json` output

use serde::Serialize;
use std::time::Duration;

/// Counters for one compress/decompress run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    /// Entries left out, such as special files or unsafe paths
    pub skipped: u64,
    /// Uncompressed content bytes archived or extracted
    pub bytes: u64,
    /// Bytes of the compressed stream written or read
    pub compressed_bytes: u64,
    pub chunks: u64,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl OperationStats {
    pub(crate) fn record_file(&mut self, size: u64) {
        self.files += 1;
        self.bytes += size;
    }

    /// Fold in the counters of the other stage of the same run
    pub(crate) fn merge(&mut self, other: &OperationStats) {
        self.files += other.files;
        self.directories += other.directories;
        self.symlinks += other.symlinks;
        self.skipped += other.skipped;
        self.bytes += other.bytes;
        self.compressed_bytes += other.compressed_bytes;
        self.chunks += other.chunks;
    }

    /// Compressed size as a fraction of the original size
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes == 0 {
            return 0.0;
        }
        self.compressed_bytes as f64 / self.bytes as f64
    }

    pub fn throughput_mib_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
