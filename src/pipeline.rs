//! The two-stage compress and decompress runs
//!
//! Every run has exactly two active stages joined by a bounded
//! [`pipe`](crate::pipe):
//!
//! ```text
//! compress:    [blocking] scan -> tar::Builder -> codec  ==pipe==>  [async] sink | ChunkWriter
//! decompress:  [async] source | ChunkReader  ==pipe==>  [blocking] codec -> tar::Archive -> disk
//! ```
//!
//! The blocking stage owns the entry checkpoints (and may prompt); the async
//! stage polls the token at chunk boundaries. A second interrupt aborts the
//! run without waiting for either stage.

use crate::archive::{self, EntryHooks, ExtractSettings, ListedEntry};
use crate::cancel::{CancellationToken, ConfirmFn};
use crate::chunk::{ChunkManifest, ChunkReader, ChunkWriter};
use crate::codec::{self, Algorithm, CodecConfig, CompressingWriter};
use crate::error::{IoContext, Result, STarError};
use crate::options::{CompressOptions, DecompressOptions};
use crate::pipe::{self, BlockingPipeReader, PipeReceiver, PipeSender};
use crate::progress::{ProgressDispatcher, ProgressEvent, ProgressSender, DRAIN_TIMEOUT};
use crate::stats::OperationStats;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::task::JoinError;

/// Where the compressed stream goes
pub enum Sink {
    /// Single archive file, or the part prefix when chunking
    File(PathBuf),
    Memory,
    /// Memory, returned base64-encoded
    Base64,
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

impl Sink {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Sink::File(path.into())
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::File(path) => f.debug_tuple("File").field(path).finish(),
            Sink::Memory => f.write_str("Memory"),
            Sink::Base64 => f.write_str("Base64"),
            Sink::Writer(_) => f.write_str("Writer"),
        }
    }
}

/// Where a compressed stream is read from
pub enum Source {
    File(PathBuf),
    Memory(Vec<u8>),
    Base64(String),
    /// Part prefix; `<prefix>.metadata` must exist
    Chunks(PathBuf),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl Source {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Source::File(path.into())
    }

    pub fn chunks(prefix: impl Into<PathBuf>) -> Self {
        Source::Chunks(prefix.into())
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::File(path) => f.debug_tuple("File").field(path).finish(),
            Source::Memory(data) => write!(f, "Memory({} bytes)", data.len()),
            Source::Base64(text) => write!(f, "Base64({} chars)", text.len()),
            Source::Chunks(prefix) => f.debug_tuple("Chunks").field(prefix).finish(),
            Source::Reader(_) => f.write_str("Reader"),
        }
    }
}

/// What a successful compress run produced
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    File(PathBuf),
    Memory(Vec<u8>),
    Base64(String),
    Chunks {
        prefix: PathBuf,
        manifest: ChunkManifest,
    },
    /// Written to a caller-supplied writer
    Stream,
}

impl Artifact {
    /// The in-memory archive, if the sink was [`Sink::Memory`]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Artifact::Memory(data) => Some(data),
            _ => None,
        }
    }
}

/// Result of [`compress`]
#[derive(Debug, Clone)]
pub struct Compressed {
    pub stats: OperationStats,
    pub artifact: Artifact,
}

/// Archive and compress `sources` into `sink`
///
/// With `options.chunk_size` set, the sink must be [`Sink::File`] and names
/// the part prefix. Output is only promoted (file renamed into place, manifest
/// written) after the whole stream arrived; any failure or cancellation
/// leaves nothing at the destination.
pub async fn compress<P: AsRef<Path>>(
    sources: &[P],
    sink: Sink,
    options: CompressOptions,
) -> Result<Compressed> {
    let started = Instant::now();
    options.validate()?;
    if options.chunk_size.is_some() && !matches!(sink, Sink::File(_)) {
        return Err(STarError::InvalidOptions(
            "chunked output needs a file prefix as its sink".to_string(),
        ));
    }
    let sources: Vec<PathBuf> = sources.iter().map(|p| p.as_ref().to_path_buf()).collect();
    tracing::debug!(
        algorithm = %options.codec.algorithm,
        sources = sources.len(),
        chunk_size = ?options.chunk_size,
        ?sink,
        "compress started"
    );

    let token = options.cancel.clone();
    let (progress, dispatcher) =
        ProgressDispatcher::spawn(options.progress.clone(), options.progress_queue_depth);
    let (tx, rx) = pipe::channel(options.pipe);

    let producer = {
        let codec = options.codec;
        let token = token.clone();
        let confirm = options.confirm.clone();
        let progress = progress.clone();
        tokio::task::spawn_blocking(move || {
            let hooks = EntryHooks {
                token: &token,
                confirm: &confirm,
                progress: &progress,
            };
            build_archive(&sources, codec, tx, &hooks)
        })
    };
    let consumer = write_sink(
        rx,
        sink,
        options.chunk_size,
        options.codec.algorithm,
        &token,
        &progress,
    );

    let outcome = tokio::select! {
        biased;
        _ = token.forced() => Err(STarError::Cancelled { forced: true }),
        (written, built) = async {
            let written = consumer.await;
            (written, producer.await)
        } => settle_compress(written, built),
    };
    drop(progress);
    let ((artifact, sink_stats), mut stats) = finish_run(outcome, dispatcher).await?;
    stats.merge(&sink_stats);

    stats.elapsed = started.elapsed();
    tracing::info!(
        files = stats.files,
        bytes = stats.bytes,
        compressed_bytes = stats.compressed_bytes,
        chunks = stats.chunks,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "compress finished"
    );
    Ok(Compressed { stats, artifact })
}

/// Decompress `source` and extract its entries under `output_dir`
pub async fn decompress(
    source: Source,
    output_dir: impl AsRef<Path>,
    options: DecompressOptions,
) -> Result<OperationStats> {
    let started = Instant::now();
    options.validate()?;
    let dest = output_dir.as_ref().to_path_buf();
    tracing::debug!(?source, dest = %dest.display(), algorithm = ?options.algorithm, "decompress started");

    let settings = ExtractSettings {
        overwrite: options.overwrite,
        preserve_permissions: options.preserve_permissions,
    };
    let (mut stats, fed) = run_decode(source, &options, move |reader, hooks| {
        archive::extract_entries(reader, &dest, settings, hooks).map(|(stats, _)| stats)
    })
    .await?;
    stats.merge(&fed);

    stats.elapsed = started.elapsed();
    tracing::info!(
        files = stats.files,
        bytes = stats.bytes,
        skipped = stats.skipped,
        chunks = stats.chunks,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "decompress finished"
    );
    Ok(stats)
}

/// Entry names, sizes and kinds, without writing anything to disk
pub async fn list_contents(source: Source) -> Result<Vec<ListedEntry>> {
    list_contents_with(source, DecompressOptions::default()).await
}

/// [`list_contents`] with an explicit algorithm, verification or token
pub async fn list_contents_with(
    source: Source,
    options: DecompressOptions,
) -> Result<Vec<ListedEntry>> {
    options.validate()?;
    let (listed, _) = run_decode(source, &options, |reader, hooks| {
        archive::list_entries(reader, hooks).map(|(listed, _)| listed)
    })
    .await?;
    Ok(listed)
}

/// Wait for queued progress events unless the run was aborted
async fn finish_run<T>(outcome: Result<T>, dispatcher: ProgressDispatcher) -> Result<T> {
    match outcome {
        Err(STarError::Cancelled { forced: true }) => {
            // the blocking stage may still hold a sender; do not wait for it
            drop(dispatcher);
            Err(STarError::Cancelled { forced: true })
        }
        other => {
            dispatcher.finish(DRAIN_TIMEOUT).await;
            other
        }
    }
}

/// Producer of a compress run, on a blocking thread
///
/// The tar footer and the codec trailer are written even when appending
/// failed; the consumer then sees `Failed` instead of `End` and does not
/// promote what it received. Returns `None` once a failure was handed to
/// the consumer.
fn build_archive(
    sources: &[PathBuf],
    codec: CodecConfig,
    tx: PipeSender,
    hooks: &EntryHooks<'_>,
) -> Option<OperationStats> {
    let entries = match archive::scan_sources(sources) {
        Ok(entries) => entries,
        Err(e) => {
            tx.blocking_fail(e);
            return None;
        }
    };

    let writer = tx.into_blocking_writer();
    let failure = writer.failure_handle();
    let encoder = match codec.open_writer(writer) {
        Ok(encoder) => encoder,
        Err(e) => {
            failure.blocking_fail(e);
            return None;
        }
    };

    let mut builder = tar::Builder::new(encoder);
    let outcome = archive::append_entries(&mut builder, &entries, hooks);
    let finalized = builder.into_inner().and_then(CompressingWriter::finish);

    match (outcome, finalized) {
        (Ok(stats), Ok(writer)) => match writer.close() {
            Ok(sent) => {
                tracing::debug!(bytes = sent, "archive stream complete");
                Some(stats)
            }
            Err(e) => {
                tracing::debug!(error = %e, "sink stopped before the stream was closed");
                None
            }
        },
        (Err(e), Ok(writer)) => {
            writer.fail(e);
            None
        }
        (Err(e), Err(_)) => {
            failure.blocking_fail(e);
            None
        }
        (Ok(_), Err(e)) => {
            failure.blocking_fail(STarError::stream("finish archive stream", e));
            None
        }
    }
}

fn settle_compress<T>(
    written: Result<T>,
    built: std::result::Result<Option<OperationStats>, JoinError>,
) -> Result<(T, OperationStats)> {
    let value = written?;
    match built {
        Ok(Some(stats)) => Ok((value, stats)),
        Ok(None) => Err(STarError::PartialWrite(
            "archive producer failed after closing the stream".to_string(),
        )),
        Err(e) => Err(STarError::PartialWrite(format!("archive producer task failed: {e}"))),
    }
}

/// Consumer of a compress run: drain the pipe into the sink
async fn write_sink(
    mut rx: PipeReceiver,
    sink: Sink,
    chunk_size: Option<u64>,
    algorithm: Algorithm,
    token: &CancellationToken,
    progress: &ProgressSender,
) -> Result<(Artifact, OperationStats)> {
    let mut stats = OperationStats::default();
    let artifact = match (sink, chunk_size) {
        (Sink::File(prefix), Some(chunk_size)) => {
            let manifest = write_chunks(
                &mut rx,
                &prefix,
                chunk_size,
                algorithm,
                token,
                progress,
                &mut stats,
            )
            .await?;
            Artifact::Chunks { prefix, manifest }
        }
        (Sink::File(path), None) => {
            write_file(&mut rx, &path, &mut stats).await?;
            Artifact::File(path)
        }
        (Sink::Memory, _) => Artifact::Memory(collect(&mut rx, &mut stats).await?),
        (Sink::Base64, _) => Artifact::Base64(STANDARD.encode(collect(&mut rx, &mut stats).await?)),
        (Sink::Writer(mut out), _) => {
            while let Some(data) = rx.next_data().await? {
                stats.compressed_bytes += data.len() as u64;
                out.write_all(&data)
                    .await
                    .map_err(|e| STarError::stream("write output stream", e))?;
            }
            out.flush()
                .await
                .map_err(|e| STarError::stream("flush output stream", e))?;
            Artifact::Stream
        }
    };
    Ok((artifact, stats))
}

async fn write_chunks(
    rx: &mut PipeReceiver,
    prefix: &Path,
    chunk_size: u64,
    algorithm: Algorithm,
    token: &CancellationToken,
    progress: &ProgressSender,
    stats: &mut OperationStats,
) -> Result<ChunkManifest> {
    let mut writer = ChunkWriter::create(prefix, chunk_size).await?;
    while let Some(data) = rx.next_data().await? {
        stats.compressed_bytes += data.len() as u64;
        for info in writer.write(&data).await? {
            stats.chunks += 1;
            progress.emit(ProgressEvent::ChunkWritten {
                index: info.index,
                size: info.size,
            });
            token.check()?;
        }
    }
    let (tail, manifest) = writer.finish(Some(algorithm)).await?;
    if let Some(info) = tail {
        stats.chunks += 1;
        progress.emit(ProgressEvent::ChunkWritten {
            index: info.index,
            size: info.size,
        });
    }
    Ok(manifest)
}

/// Stream into a temporary file next to `path` and rename it into place
async fn write_file(rx: &mut PipeReceiver, path: &Path, stats: &mut OperationStats) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let (file, temp_path) = tempfile::Builder::new()
        .prefix(".s-tar-")
        .suffix(".partial")
        .tempfile_in(dir)
        .io_ctx("create temporary output", dir)?
        .into_parts();

    let mut out = BufWriter::new(tokio::fs::File::from_std(file));
    while let Some(data) = rx.next_data().await? {
        stats.compressed_bytes += data.len() as u64;
        out.write_all(&data)
            .await
            .io_ctx("write output", &temp_path)?;
    }
    out.flush().await.io_ctx("flush output", &temp_path)?;
    out.into_inner()
        .sync_all()
        .await
        .io_ctx("sync output", &temp_path)?;

    temp_path
        .persist(path)
        .map_err(|e| STarError::io("promote output", path, e.error))?;
    tracing::debug!(path = %path.display(), bytes = stats.compressed_bytes, "archive written");
    Ok(())
}

async fn collect(rx: &mut PipeReceiver, stats: &mut OperationStats) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    while let Some(data) = rx.next_data().await? {
        buffer.extend_from_slice(&data);
    }
    stats.compressed_bytes = buffer.len() as u64;
    Ok(buffer)
}

/// Run a decode with `consume` on the blocking stage
///
/// Returns the consumer's value and the source-side counters.
async fn run_decode<T, F>(
    source: Source,
    options: &DecompressOptions,
    consume: F,
) -> Result<(T, OperationStats)>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn Read, &EntryHooks<'_>) -> Result<T> + Send + 'static,
{
    let token = options.cancel.clone();
    let (progress, dispatcher) =
        ProgressDispatcher::spawn(options.progress.clone(), options.progress_queue_depth);
    let (tx, rx) = pipe::channel(options.pipe);

    let consumer = {
        let algorithm = options.algorithm;
        let token = token.clone();
        let confirm: ConfirmFn = options.confirm.clone();
        let progress = progress.clone();
        tokio::task::spawn_blocking(move || {
            let hooks = EntryHooks {
                token: &token,
                confirm: &confirm,
                progress: &progress,
            };
            let mut reader = rx.into_blocking_reader();
            let upstream = reader.upstream_error();
            read_decoded(&mut reader, algorithm, |decoded| consume(decoded, &hooks))
                .map_err(|e| upstream.take().unwrap_or(e))
        })
    };
    let producer = feed_source(
        source,
        tx,
        options.verify_checksum,
        token.clone(),
        progress.clone(),
    );

    let outcome = tokio::select! {
        biased;
        _ = token.forced() => Err(STarError::Cancelled { forced: true }),
        (fed, consumed) = async { tokio::join!(producer, consumer) } => settle_decode(consumed, fed),
    };
    drop(progress);
    finish_run(outcome, dispatcher).await
}

fn settle_decode<T>(
    consumed: std::result::Result<Result<T>, JoinError>,
    fed: Option<OperationStats>,
) -> Result<(T, OperationStats)> {
    let value = consumed
        .map_err(|e| STarError::PartialWrite(format!("archive reader task failed: {e}")))??;
    let stats = fed.ok_or_else(|| {
        STarError::PartialWrite("source failed after the archive was read".to_string())
    })?;
    Ok((value, stats))
}

/// Detect the codec, hand the decoded stream to `consume`, then drain both
///
/// The decoder is read to its end so a damaged or missing trailer fails the
/// run. Draining the pipe up to the end marker surfaces a source failure
/// (for example a corrupt last chunk) even when tar stopped reading early.
fn read_decoded<T>(
    reader: &mut BlockingPipeReader,
    algorithm: Option<Algorithm>,
    consume: impl FnOnce(&mut dyn Read) -> Result<T>,
) -> Result<T> {
    let prefix = codec::sniff(reader).map_err(|e| STarError::stream("read archive", e))?;
    let algorithm = match algorithm {
        Some(algorithm) => algorithm,
        None => Algorithm::detect(&prefix)?,
    };
    tracing::debug!(%algorithm, "decoding archive stream");

    let value = {
        let mut decoded = algorithm.open_reader(Read::chain(Cursor::new(prefix), &mut *reader))?;
        let value = consume(&mut decoded)?;
        // tar stops at its end blocks; the codec checks its trailer only at EOF
        io::copy(&mut decoded, &mut io::sink()).map_err(decode_error)?;
        value
    };
    let trailing = reader
        .drain()
        .map_err(|e| STarError::stream("read archive", e))?;
    if trailing > 0 {
        tracing::trace!(bytes = trailing, "discarded bytes after the archive end");
    }
    Ok(value)
}

fn decode_error(e: io::Error) -> STarError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            STarError::InvalidFormat(format!("corrupt compressed stream: {e}"))
        }
        _ => STarError::stream("read archive", e),
    }
}

/// Producer of a decompress run
///
/// Returns `None` once a failure was handed to the consumer.
async fn feed_source(
    source: Source,
    tx: PipeSender,
    verify: bool,
    token: CancellationToken,
    progress: ProgressSender,
) -> Option<OperationStats> {
    let mut stats = OperationStats::default();
    match send_source(source, &tx, verify, &token, &progress, &mut stats).await {
        Ok(()) => match tx.close().await {
            Ok(()) => Some(stats),
            Err(e) => {
                tracing::debug!(error = %e, "archive reader stopped before the end of the source");
                None
            }
        },
        Err(e) => {
            tracing::debug!(error = %e, "source failed");
            tx.fail(e).await;
            None
        }
    }
}

async fn send_source(
    source: Source,
    tx: &PipeSender,
    verify: bool,
    token: &CancellationToken,
    progress: &ProgressSender,
    stats: &mut OperationStats,
) -> Result<()> {
    match source {
        Source::File(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .io_ctx("open archive", &path)?;
            send_reader(file, tx, stats).await.io_ctx("read archive", &path)
        }
        Source::Memory(data) => send_bytes(&data, tx, stats).await,
        Source::Base64(text) => {
            let data = STANDARD
                .decode(text.trim())
                .map_err(|e| STarError::InvalidFormat(format!("base64 payload: {e}")))?;
            send_bytes(&data, tx, stats).await
        }
        Source::Chunks(prefix) => {
            let reader = ChunkReader::open(prefix, verify).await?;
            stats.compressed_bytes = reader.stream_into(tx, token, progress).await?;
            stats.chunks = reader.manifest().total_chunks as u64;
            Ok(())
        }
        Source::Reader(reader) => send_reader(reader, tx, stats)
            .await
            .map_err(|e| STarError::stream("read input stream", e)),
    }
}

async fn send_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: &PipeSender,
    stats: &mut OperationStats,
) -> std::io::Result<()> {
    loop {
        let mut frame = vec![0u8; tx.frame_size()];
        let n = reader.read(&mut frame).await?;
        if n == 0 {
            return Ok(());
        }
        frame.truncate(n);
        stats.compressed_bytes += n as u64;
        tx.send_data(frame).await?;
    }
}

async fn send_bytes(data: &[u8], tx: &PipeSender, stats: &mut OperationStats) -> Result<()> {
    for piece in data.chunks(tx.frame_size()) {
        tx.send_data(piece.to_vec()).await?;
        stats.compressed_bytes += piece.len() as u64;
    }
    Ok(())
}
