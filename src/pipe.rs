//! Bounded byte channel between the producing and consuming stage of a run
//!
//! The channel holds at most `depth` frames of up to `frame_size` bytes, so
//! memory in flight stays constant no matter how large the archive is. A full
//! channel suspends the producer; an empty one suspends the consumer.
//!
//! End-of-stream is explicit: the producer sends [`Frame::End`] on success or
//! [`Frame::Failed`] with its error. A sender that disappears without either
//! is reported to the consumer as [`STarError::PartialWrite`], never as a
//! clean finish.

use crate::error::{Result, STarError};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Default size of one frame (256KB)
pub const DEFAULT_FRAME_SIZE: usize = 256 * 1024;

/// Default number of frames that may be queued
pub const DEFAULT_DEPTH: usize = 4;

/// Sizing of the channel between the two stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeConfig {
    /// Bytes coalesced into one frame before it is handed over
    pub frame_size: usize,
    /// Frames allowed in flight before the producer blocks
    pub depth: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            depth: DEFAULT_DEPTH,
        }
    }
}

impl PipeConfig {
    /// Lock-step handoff: one frame in flight at a time
    pub fn single_slot(frame_size: usize) -> Self {
        Self {
            frame_size,
            depth: 1,
        }
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_size == 0 {
            return Err(STarError::InvalidOptions(
                "pipe frame size must be at least 1 byte".to_string(),
            ));
        }
        if self.depth == 0 {
            return Err(STarError::InvalidOptions(
                "pipe depth must be at least 1 frame".to_string(),
            ));
        }
        Ok(())
    }

    /// Upper bound of bytes buffered between the stages
    ///
    /// Queued frames, plus one being filled by the producer and one being
    /// drained by the consumer.
    pub fn estimated_peak_memory(&self) -> usize {
        (self.depth + 2) * self.frame_size
    }
}

/// Unit moved through the channel
#[derive(Debug)]
pub enum Frame {
    Data(Vec<u8>),
    /// Producer finished and every byte was sent
    End,
    /// Producer gave up; no further frames follow
    Failed(STarError),
}

/// Create a connected sender/receiver pair
pub fn channel(config: PipeConfig) -> (PipeSender, PipeReceiver) {
    let (tx, rx) = mpsc::channel(config.depth.max(1));
    (
        PipeSender {
            tx,
            frame_size: config.frame_size.max(1),
        },
        PipeReceiver { rx, finished: false },
    )
}

/// Producer half of the channel
#[derive(Clone)]
pub struct PipeSender {
    tx: mpsc::Sender<Frame>,
    frame_size: usize,
}

fn consumer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe consumer has stopped")
}

impl PipeSender {
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Queue a data frame, waiting while the channel is full
    pub async fn send_data(&self, data: Vec<u8>) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Frame::Data(data))
            .await
            .map_err(|_| consumer_gone())
    }

    /// Mark the stream complete
    pub async fn close(self) -> io::Result<()> {
        self.tx.send(Frame::End).await.map_err(|_| consumer_gone())
    }

    /// Hand the producer's error to the consumer
    pub async fn fail(self, err: STarError) {
        if self.tx.send(Frame::Failed(err)).await.is_err() {
            tracing::trace!("pipe consumer gone before producer failure was delivered");
        }
    }

    /// Same as [`PipeSender::fail`], for producers on a blocking thread
    pub fn blocking_fail(self, err: STarError) {
        if self.tx.blocking_send(Frame::Failed(err)).is_err() {
            tracing::trace!("pipe consumer gone before producer failure was delivered");
        }
    }

    /// Adapt into an `io::Write` for producers on a blocking thread
    pub fn into_blocking_writer(self) -> BlockingPipeWriter {
        BlockingPipeWriter {
            buffer: Vec::with_capacity(self.frame_size),
            sender: self,
            bytes_sent: 0,
        }
    }
}

/// `io::Write` end of the channel, for use off the async runtime
///
/// Writes are coalesced into frames of `frame_size` bytes; handing a frame
/// over blocks the thread while the channel is full.
pub struct BlockingPipeWriter {
    sender: PipeSender,
    buffer: Vec<u8>,
    bytes_sent: u64,
}

impl BlockingPipeWriter {
    /// Handle that can report a failure after this writer has been moved into a codec
    pub fn failure_handle(&self) -> PipeSender {
        self.sender.clone()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn send_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let frame = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.sender.frame_size));
        self.bytes_sent += frame.len() as u64;
        self.sender
            .tx
            .blocking_send(Frame::Data(frame))
            .map_err(|_| consumer_gone())
    }

    /// Send what is buffered and mark the stream complete
    pub fn close(mut self) -> io::Result<u64> {
        self.send_buffer()?;
        self.sender
            .tx
            .blocking_send(Frame::End)
            .map_err(|_| consumer_gone())?;
        Ok(self.bytes_sent)
    }

    /// Discard what is buffered and report `err` instead of completion
    pub fn fail(self, err: STarError) {
        self.sender.blocking_fail(err);
    }
}

impl Write for BlockingPipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.sender.frame_size - self.buffer.len();
        let take = room.min(buf.len());
        self.buffer.extend_from_slice(&buf[..take]);
        if self.buffer.len() >= self.sender.frame_size {
            self.send_buffer()?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffer()
    }
}

/// Consumer half of the channel
pub struct PipeReceiver {
    rx: mpsc::Receiver<Frame>,
    finished: bool,
}

impl PipeReceiver {
    /// Next chunk of bytes, `Ok(None)` once the producer has closed the stream
    pub async fn next_data(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(frame) => self.accept(frame),
            None => Err(self.producer_vanished()),
        }
    }

    fn blocking_next_data(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.blocking_recv() {
            Some(frame) => self.accept(frame),
            None => Err(self.producer_vanished()),
        }
    }

    fn accept(&mut self, frame: Frame) -> Result<Option<Vec<u8>>> {
        match frame {
            Frame::Data(data) => Ok(Some(data)),
            Frame::End => {
                self.finished = true;
                Ok(None)
            }
            Frame::Failed(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }

    fn producer_vanished(&mut self) -> STarError {
        self.finished = true;
        STarError::PartialWrite("producer stopped before completing the stream".to_string())
    }

    /// Adapt into an `io::Read` for consumers on a blocking thread
    pub fn into_blocking_reader(self) -> BlockingPipeReader {
        BlockingPipeReader {
            receiver: self,
            current: Vec::new(),
            offset: 0,
            upstream: UpstreamError::default(),
        }
    }
}

/// Slot holding the typed error that ended a [`BlockingPipeReader`]
///
/// Codec and tar layers only see an `io::Error`; the coordinator takes the
/// original error back out of this slot.
#[derive(Clone, Default)]
pub struct UpstreamError(Arc<Mutex<Option<STarError>>>);

impl UpstreamError {
    fn set(&self, err: STarError) {
        if let Ok(mut slot) = self.0.lock() {
            slot.get_or_insert(err);
        }
    }

    pub fn take(&self) -> Option<STarError> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// `io::Read` end of the channel, for use off the async runtime
pub struct BlockingPipeReader {
    receiver: PipeReceiver,
    current: Vec<u8>,
    offset: usize,
    upstream: UpstreamError,
}

impl BlockingPipeReader {
    pub fn upstream_error(&self) -> UpstreamError {
        self.upstream.clone()
    }

    /// Consume and discard the rest of the stream up to its end marker
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }
}

impl Read for BlockingPipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset >= self.current.len() {
            match self.receiver.blocking_next_data() {
                Ok(Some(data)) => {
                    self.current = data;
                    self.offset = 0;
                }
                Ok(None) => return Ok(0),
                Err(err) => {
                    let kind = match err {
                        STarError::PartialWrite(_) => io::ErrorKind::UnexpectedEof,
                        _ => io::ErrorKind::Other,
                    };
                    let message = err.to_string();
                    self.upstream.set(err);
                    return Err(io::Error::new(kind, message));
                }
            }
        }

        let available = &self.current[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}
