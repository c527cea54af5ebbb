//! Split a compressed stream into checksummed part files and put it back together
//!
//! Layout on disk for a prefix `backup`:
//!
//! ```text
//! backup.part0000
//! backup.part0001
//! ...
//! backup.metadata      JSON manifest, written last
//! ```
//!
//! A part is opened only when its first byte arrives. A stream that ends
//! exactly on a part boundary therefore has no trailing empty part; the last
//! part written carries `is_last`. An input with no bytes at all has no parts.
//!
//! The manifest is the commit point. Until it exists the part set is treated
//! as unusable, and a writer that is dropped before finishing removes every
//! part it created.

use crate::cancel::CancellationToken;
use crate::codec::Algorithm;
use crate::error::{IoContext, Result, STarError};
use crate::pipe::PipeSender;
use crate::progress::{ProgressEvent, ProgressSender};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

/// Default part size (50MB)
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Manifest format version written by this crate
pub const MANIFEST_VERSION: &str = "1.0";

const HASH_BUFFER_SIZE: usize = 64 * 1024;

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// `<prefix>.partNNNN`
pub fn part_path(prefix: &Path, index: u32) -> PathBuf {
    with_suffix(prefix, &format!(".part{index:04}"))
}

/// `<prefix>.metadata`
pub fn manifest_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".metadata")
}

/// Metadata of one part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub size: u64,
    /// SHA-256 of the part's bytes, lowercase hex
    pub checksum: String,
    #[serde(default)]
    pub is_last: bool,
}

/// Ordered list of parts forming one compressed stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub version: String,
    pub total_chunks: u32,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<Algorithm>,
    pub chunks: Vec<ChunkInfo>,
}

impl ChunkManifest {
    fn new(chunks: Vec<ChunkInfo>, algorithm: Option<Algorithm>) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            total_chunks: chunks.len() as u32,
            total_size: chunks.iter().map(|c| c.size).sum(),
            algorithm,
            chunks,
        }
    }

    /// Read and validate `<prefix>.metadata`
    pub async fn load(prefix: &Path) -> Result<Self> {
        let path = manifest_path(prefix);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(STarError::ManifestMissing { path })
            }
            Err(e) => return Err(STarError::io("read manifest", &path, e)),
        };
        let manifest: ChunkManifest = serde_json::from_slice(&raw)
            .map_err(|e| STarError::InvalidFormat(format!("{}: {e}", path.display())))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Write `<prefix>.metadata` through a temporary file and rename
    pub async fn save(&self, prefix: &Path) -> Result<()> {
        let path = manifest_path(prefix);
        let tmp = with_suffix(prefix, ".metadata.tmp");
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| STarError::InvalidFormat(format!("encode manifest: {e}")))?;
        tokio::fs::write(&tmp, json)
            .await
            .io_ctx("write manifest", &tmp)?;
        tokio::fs::rename(&tmp, &path)
            .await
            .io_ctx("commit manifest", &path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.version.starts_with("1.") {
            return Err(STarError::InvalidFormat(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }
        if self.total_chunks as usize != self.chunks.len() {
            return Err(STarError::InvalidFormat(format!(
                "manifest lists {} chunks but declares {}",
                self.chunks.len(),
                self.total_chunks
            )));
        }
        for (position, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != position {
                return Err(STarError::InvalidFormat(format!(
                    "manifest chunk at position {position} has index {}",
                    chunk.index
                )));
            }
        }
        Ok(())
    }
}

struct OpenPart {
    index: u32,
    path: PathBuf,
    file: BufWriter<tokio::fs::File>,
    hasher: Sha256,
    size: u64,
}

/// Accepts the compressed stream incrementally and cuts it into part files
pub struct ChunkWriter {
    prefix: PathBuf,
    chunk_size: u64,
    current: Option<OpenPart>,
    chunks: Vec<ChunkInfo>,
    created: Vec<PathBuf>,
    committed: bool,
}

impl ChunkWriter {
    /// Prepare to write parts at `prefix`
    ///
    /// A manifest left at the same prefix by an earlier run is removed first,
    /// so a crash cannot leave it describing a mix of old and new parts.
    pub async fn create(prefix: impl Into<PathBuf>, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(STarError::InvalidOptions(
                "chunk size must be at least 1 byte".to_string(),
            ));
        }
        let prefix = prefix.into();
        let stale = manifest_path(&prefix);
        match tokio::fs::remove_file(&stale).await {
            Ok(()) => tracing::debug!(path = %stale.display(), "removed stale manifest"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(STarError::io("remove stale manifest", &stale, e)),
        }
        Ok(Self {
            prefix,
            chunk_size,
            current: None,
            chunks: Vec::new(),
            created: Vec::new(),
            committed: false,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn bytes_written(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum::<u64>()
            + self.current.as_ref().map_or(0, |p| p.size)
    }

    /// Append bytes; returns the parts completed by this call, in index order
    pub async fn write(&mut self, mut data: &[u8]) -> Result<Vec<ChunkInfo>> {
        let mut completed = Vec::new();
        while !data.is_empty() {
            if self.current.is_none() {
                self.open_part().await?;
            }
            let Some(part) = self.current.as_mut() else {
                return Err(STarError::PartialWrite("chunk was not opened".to_string()));
            };
            let room = (self.chunk_size - part.size) as usize;
            let take = room.min(data.len());
            part.file
                .write_all(&data[..take])
                .await
                .io_ctx("write chunk", &part.path)?;
            part.hasher.update(&data[..take]);
            part.size += take as u64;
            data = &data[take..];

            if part.size == self.chunk_size {
                completed.push(self.close_part(false).await?);
            }
        }
        Ok(completed)
    }

    async fn open_part(&mut self) -> Result<()> {
        let index = self.chunks.len() as u32;
        let path = part_path(&self.prefix, index);
        let file = tokio::fs::File::create(&path)
            .await
            .io_ctx("create chunk", &path)?;
        self.created.push(path.clone());
        tracing::trace!(index, path = %path.display(), "opened chunk");
        self.current = Some(OpenPart {
            index,
            path,
            file: BufWriter::new(file),
            hasher: Sha256::new(),
            size: 0,
        });
        Ok(())
    }

    async fn close_part(&mut self, is_last: bool) -> Result<ChunkInfo> {
        let mut part = self
            .current
            .take()
            .ok_or_else(|| STarError::PartialWrite("no open chunk to close".to_string()))?;
        part.file.flush().await.io_ctx("flush chunk", &part.path)?;
        part.file
            .into_inner()
            .sync_all()
            .await
            .io_ctx("sync chunk", &part.path)?;
        let info = ChunkInfo {
            index: part.index,
            size: part.size,
            checksum: hex::encode(part.hasher.finalize()),
            is_last,
        };
        tracing::debug!(index = info.index, size = info.size, "chunk complete");
        self.chunks.push(info.clone());
        Ok(info)
    }

    /// Close the final part and commit the manifest
    ///
    /// Returns the final part if it was still open, plus the manifest.
    pub async fn finish(
        mut self,
        algorithm: Option<Algorithm>,
    ) -> Result<(Option<ChunkInfo>, ChunkManifest)> {
        let tail = if self.current.is_some() {
            Some(self.close_part(true).await?)
        } else {
            if let Some(last) = self.chunks.last_mut() {
                last.is_last = true;
            }
            None
        };
        let manifest = ChunkManifest::new(std::mem::take(&mut self.chunks), algorithm);
        manifest.save(&self.prefix).await?;
        self.committed = true;
        tracing::debug!(
            chunks = manifest.total_chunks,
            bytes = manifest.total_size,
            "chunk manifest committed"
        );
        Ok((tail, manifest))
    }

    /// Remove every part created so far
    pub fn discard(&mut self) {
        self.current = None;
        for path in self.created.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove chunk");
                }
            }
        }
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        if !self.committed && !self.created.is_empty() {
            tracing::debug!(prefix = %self.prefix.display(), "removing uncommitted chunks");
            self.discard();
        }
    }
}

/// Reads a part set back in index order, manifest first
pub struct ChunkReader {
    prefix: PathBuf,
    manifest: ChunkManifest,
    verify: bool,
}

/// `ChunkMissing` only when the part is truly absent; any other stat failure is I/O
async fn ensure_part(path: PathBuf, index: u32) -> Result<()> {
    match tokio::fs::try_exists(&path).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(STarError::ChunkMissing { index, path }),
        Err(e) => Err(STarError::io("stat chunk", &path, e)),
    }
}

impl ChunkReader {
    /// Load the manifest and check that every listed part exists
    pub async fn open(prefix: impl Into<PathBuf>, verify: bool) -> Result<Self> {
        let prefix = prefix.into();
        let manifest = ChunkManifest::load(&prefix).await?;
        for info in &manifest.chunks {
            ensure_part(part_path(&prefix, info.index), info.index).await?;
        }
        Ok(Self {
            prefix,
            manifest,
            verify,
        })
    }

    pub fn manifest(&self) -> &ChunkManifest {
        &self.manifest
    }

    async fn open_part(&self, info: &ChunkInfo) -> Result<(PathBuf, tokio::fs::File)> {
        let path = part_path(&self.prefix, info.index);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(STarError::ChunkMissing {
                index: info.index,
                path,
            }),
            Err(e) => Err(STarError::io("open chunk", &path, e)),
        }
    }

    /// Recompute size and checksum of one part against the manifest
    pub async fn verify_chunk(&self, info: &ChunkInfo) -> Result<()> {
        let (path, mut file) = self.open_part(info).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf).await.io_ctx("read chunk", &path)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        if size != info.size {
            return Err(STarError::ChunkCorrupt {
                index: info.index,
                expected: format!("{} bytes", info.size),
                actual: format!("{size} bytes"),
            });
        }
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(&info.checksum) {
            return Err(STarError::ChunkCorrupt {
                index: info.index,
                expected: info.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Feed every part, in index order, into the pipe
    ///
    /// With verification on, a part is checked before any of its bytes are
    /// sent. Cancellation is polled between parts. Returns the bytes sent.
    pub async fn stream_into(
        &self,
        sender: &PipeSender,
        token: &CancellationToken,
        progress: &ProgressSender,
    ) -> Result<u64> {
        let mut total = 0u64;
        for info in &self.manifest.chunks {
            token.check()?;
            if self.verify {
                self.verify_chunk(info).await?;
            }
            let (path, mut file) = self.open_part(info).await?;
            let mut sent = 0u64;
            loop {
                let mut frame = vec![0u8; sender.frame_size()];
                let n = file.read(&mut frame).await.io_ctx("read chunk", &path)?;
                if n == 0 {
                    break;
                }
                frame.truncate(n);
                sent += n as u64;
                sender.send_data(frame).await?;
            }
            if sent != info.size {
                return Err(STarError::ChunkCorrupt {
                    index: info.index,
                    expected: format!("{} bytes", info.size),
                    actual: format!("{sent} bytes"),
                });
            }
            tracing::trace!(index = info.index, size = sent, "chunk streamed");
            progress.emit(ProgressEvent::ChunkVerified {
                index: info.index,
                size: sent,
            });
            total += sent;
        }
        Ok(total)
    }
}
