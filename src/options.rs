//! Options for compress and decompress runs

use crate::archive::OverwritePolicy;
use crate::cancel::{always_confirm, CancellationToken, ConfirmFn};
use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::codec::{Algorithm, CodecConfig, Profile};
use crate::error::{Result, STarError};
use crate::pipe::PipeConfig;
use crate::progress::{ProgressNotifier, DEFAULT_QUEUE_DEPTH};
use std::fmt;
use std::sync::Arc;

/// Configuration of a [`crate::compress`] run
#[derive(Clone)]
pub struct CompressOptions {
    pub codec: CodecConfig,
    /// Split the output into parts of this many bytes
    pub chunk_size: Option<u64>,
    pub pipe: PipeConfig,
    pub progress: Option<Arc<dyn ProgressNotifier>>,
    pub progress_queue_depth: usize,
    pub cancel: CancellationToken,
    /// Asked at the next entry once an interrupt is pending
    pub confirm: ConfirmFn,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            chunk_size: None,
            pipe: PipeConfig::default(),
            progress: None,
            progress_queue_depth: DEFAULT_QUEUE_DEPTH,
            cancel: CancellationToken::new(),
            confirm: always_confirm(),
        }
    }
}

impl fmt::Debug for CompressOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressOptions")
            .field("codec", &self.codec)
            .field("chunk_size", &self.chunk_size)
            .field("pipe", &self.pipe)
            .field("progress", &self.progress.is_some())
            .field("progress_queue_depth", &self.progress_queue_depth)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl CompressOptions {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            codec: CodecConfig::new(algorithm),
            ..Default::default()
        }
    }

    /// Fastest compiled-in codec
    pub fn fast() -> Self {
        Self::with_profile(Profile::VeryFast)
    }

    /// gzip at its default level
    pub fn balanced() -> Self {
        Self::default()
    }

    /// Smallest output among compiled-in codecs
    pub fn high_ratio() -> Self {
        Self::with_profile(Profile::HighRatio)
    }

    pub fn with_profile(profile: Profile) -> Self {
        Self {
            codec: CodecConfig::from_profile(profile),
            ..Default::default()
        }
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.codec.level = Some(level);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Chunk at [`DEFAULT_CHUNK_SIZE`]
    pub fn with_default_chunking(self) -> Self {
        self.with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_pipe(mut self, pipe: PipeConfig) -> Self {
        self.pipe = pipe;
        self
    }

    pub fn with_progress(mut self, notifier: impl ProgressNotifier + 'static) -> Self {
        self.progress = Some(Arc::new(notifier));
        self
    }

    pub fn with_progress_queue_depth(mut self, depth: usize) -> Self {
        self.progress_queue_depth = depth;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_confirm(mut self, confirm: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.confirm = Arc::new(confirm);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.codec.algorithm.ensure_available()?;
        self.pipe.validate()?;
        if self.chunk_size == Some(0) {
            return Err(STarError::InvalidOptions(
                "chunk size must be at least 1 byte".to_string(),
            ));
        }
        validate_queue_depth(self.progress_queue_depth)
    }
}

/// Configuration of a [`crate::decompress`] run
#[derive(Clone)]
pub struct DecompressOptions {
    /// `None` detects the algorithm from the leading bytes
    pub algorithm: Option<Algorithm>,
    /// Recompute chunk checksums before feeding each part
    pub verify_checksum: bool,
    pub overwrite: OverwritePolicy,
    pub preserve_permissions: bool,
    pub pipe: PipeConfig,
    pub progress: Option<Arc<dyn ProgressNotifier>>,
    pub progress_queue_depth: usize,
    pub cancel: CancellationToken,
    pub confirm: ConfirmFn,
}

impl Default for DecompressOptions {
    fn default() -> Self {
        Self {
            algorithm: None,
            verify_checksum: true,
            overwrite: OverwritePolicy::default(),
            preserve_permissions: true,
            pipe: PipeConfig::default(),
            progress: None,
            progress_queue_depth: DEFAULT_QUEUE_DEPTH,
            cancel: CancellationToken::new(),
            confirm: always_confirm(),
        }
    }
}

impl fmt::Debug for DecompressOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecompressOptions")
            .field("algorithm", &self.algorithm)
            .field("verify_checksum", &self.verify_checksum)
            .field("overwrite", &self.overwrite)
            .field("preserve_permissions", &self.preserve_permissions)
            .field("pipe", &self.pipe)
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl DecompressOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    pub fn with_verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn with_overwrite(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = policy;
        self
    }

    pub fn with_preserve_permissions(mut self, preserve: bool) -> Self {
        self.preserve_permissions = preserve;
        self
    }

    pub fn with_pipe(mut self, pipe: PipeConfig) -> Self {
        self.pipe = pipe;
        self
    }

    pub fn with_progress(mut self, notifier: impl ProgressNotifier + 'static) -> Self {
        self.progress = Some(Arc::new(notifier));
        self
    }

    pub fn with_progress_queue_depth(mut self, depth: usize) -> Self {
        self.progress_queue_depth = depth;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_confirm(mut self, confirm: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.confirm = Arc::new(confirm);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(algorithm) = self.algorithm {
            algorithm.ensure_available()?;
        }
        self.pipe.validate()?;
        validate_queue_depth(self.progress_queue_depth)
    }
}

fn validate_queue_depth(depth: usize) -> Result<()> {
    if depth == 0 {
        return Err(STarError::InvalidOptions(
            "progress queue depth must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_defaults_and_builders() {
        let options = CompressOptions::default();
        assert_eq!(options.codec.algorithm, Algorithm::Gzip);
        assert_eq!(options.chunk_size, None);
        assert!(options.validate().is_ok());

        let chunked = CompressOptions::new(Algorithm::None).with_default_chunking();
        assert_eq!(chunked.chunk_size, Some(50 * 1024 * 1024));

        assert!(CompressOptions::default()
            .with_chunk_size(0)
            .validate()
            .is_err());
        assert!(CompressOptions::default()
            .with_progress_queue_depth(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_decompress_defaults() {
        let options = DecompressOptions::default();
        assert!(options.verify_checksum);
        assert!(options.preserve_permissions);
        assert_eq!(options.overwrite, OverwritePolicy::Overwrite);
        assert_eq!(options.algorithm, None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_debug_hides_callbacks() {
        let options = CompressOptions::default().with_confirm(|| false);
        let rendered = format!("{options:?}");
        assert!(rendered.contains("Gzip"));
        assert!(rendered.contains("progress: false"));
    }

    #[cfg(not(feature = "zstd-support"))]
    #[test]
    fn test_unavailable_codec_rejected() {
        let err = CompressOptions::new(Algorithm::Zstd).validate().unwrap_err();
        assert!(matches!(err, STarError::CodecUnavailable { .. }));
    }
}
