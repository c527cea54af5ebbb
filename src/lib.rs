//! # s-tar: Streaming Tar Compressor
//!
//! `s-tar` archives files and directories into a compressed tar stream, and
//! back, without ever holding the whole archive in memory. Output can go to a
//! single file, memory, base64 text, any async writer, or a set of
//! checksummed part files with a JSON manifest.
//!
//! ## Features
//!
//! - **Streaming**: a producer and a consumer stage joined by a bounded channel;
//!   memory in flight is constant regardless of archive size
//! - **Chunked Output**: fixed-size `.partNNNN` files, SHA-256 per part,
//!   verified before any part is decompressed
//! - **Pluggable Codecs**: gzip always; bzip2, xz and lz4 by default; zstd with
//!   the `zstd-support` feature
//! - **Auto-detect**: the algorithm is recognised from the leading bytes
//! - **Cancellation**: interrupts are confirmed at entry boundaries; a second
//!   interrupt aborts
//!
//! ## Quick Start
//!
//! ### Compressing a directory
//!
//! ```no_run
//! use s_tar::{compress, Algorithm, CompressOptions, Sink};
//!
//! # async fn run() -> s_tar::Result<()> {
//! let done = compress(
//!     &["project/"],
//!     Sink::file("project.tar.gz"),
//!     CompressOptions::new(Algorithm::Gzip),
//! )
//! .await?;
//! println!("{} files, {} bytes", done.stats.files, done.stats.compressed_bytes);
//! # Ok(())
//! # }
//! ```
//!
//! ### Chunked output and extraction
//!
//! ```no_run
//! use s_tar::{compress, decompress, CompressOptions, DecompressOptions, Sink, Source};
//!
//! # async fn run() -> s_tar::Result<()> {
//! // backup.part0000, backup.part0001, ... plus backup.metadata
//! compress(
//!     &["data/"],
//!     Sink::file("backup"),
//!     CompressOptions::balanced().with_chunk_size(10 * 1024 * 1024),
//! )
//! .await?;
//!
//! decompress(Source::chunks("backup"), "restored", DecompressOptions::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Listing without extracting
//!
//! ```no_run
//! use s_tar::{list_contents, Source};
//!
//! # async fn run() -> s_tar::Result<()> {
//! for entry in list_contents(Source::file("project.tar.gz")).await? {
//!     println!("{}: {} bytes", entry.name, entry.size);
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cancel;
pub mod chunk;
pub mod codec;
pub mod error;
pub mod options;
pub mod pipe;
pub mod pipeline;
pub mod progress;
pub mod stats;

pub use archive::{ListedEntry, OverwritePolicy};
pub use cancel::{CancellationState, CancellationToken};
pub use chunk::{ChunkInfo, ChunkManifest};
pub use codec::{Algorithm, CodecConfig, Profile};
pub use error::{Result, STarError};
pub use options::{CompressOptions, DecompressOptions};
pub use pipe::PipeConfig;
pub use pipeline::{
    compress, decompress, list_contents, list_contents_with, Artifact, Compressed, Sink, Source,
};
pub use progress::{ProgressEvent, ProgressNotifier};
pub use stats::OperationStats;
