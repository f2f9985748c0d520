//! Bounded in-process byte pipe joining the archive and transport stages.
//!
//! The pipe carries fixed-size chunks over a `sync_channel`, so the writer
//! blocks once `capacity` bytes are queued and the reader blocks while the
//! queue is empty. Closing the writer is the only end-of-stream signal.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::mpsc;

/// Largest chunk handed across the channel.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Default pipe capacity (4 MiB in flight).
pub const DEFAULT_CAPACITY: usize = 4 * 1024 * 1024;

/// Why a pipe stopped carrying data before a clean close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeClosed {
    /// The reading half was dropped while the writer still had data.
    ReaderGone,
    /// The writing half was dropped without `close()`.
    WriterDropped,
    /// The producer gave up and said why.
    Aborted(String),
}

impl fmt::Display for PipeClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeClosed::ReaderGone => write!(f, "pipe reader went away"),
            PipeClosed::WriterDropped => write!(f, "pipe writer dropped without close"),
            PipeClosed::Aborted(reason) => write!(f, "producer aborted: {reason}"),
        }
    }
}

impl std::error::Error for PipeClosed {}

impl From<PipeClosed> for io::Error {
    fn from(closed: PipeClosed) -> Self {
        io::Error::new(io::ErrorKind::BrokenPipe, closed)
    }
}

type Chunk = Result<Vec<u8>, PipeClosed>;

/// Create a pipe holding at most `capacity` bytes in its queue.
///
/// A capacity of zero is treated as one byte.
pub fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    let capacity = capacity.max(1);
    let chunk_size = capacity.min(MAX_CHUNK_SIZE);
    let slots = (capacity / chunk_size).max(1);
    let (tx, rx) = mpsc::sync_channel::<Chunk>(slots);
    (
        PipeReader {
            rx,
            buffer: Vec::new(),
            buffer_pos: 0,
            failure: None,
        },
        PipeWriter {
            tx: Some(tx),
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
        },
    )
}

/// Writing half. Exactly one per pipe.
pub struct PipeWriter {
    tx: Option<mpsc::SyncSender<Chunk>>,
    buffer: Vec<u8>,
    chunk_size: usize,
}

impl PipeWriter {
    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let tx = match self.tx.as_ref() {
            Some(tx) => tx,
            None => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe already closed")),
        };
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        tx.send(Ok(chunk)).map_err(|_| PipeClosed::ReaderGone.into())
    }

    /// Flush buffered bytes and signal end-of-stream.
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        if self.tx.is_none() {
            return Ok(());
        }
        let flushed = self.flush_buffer();
        self.tx = None;
        flushed
    }

    /// Deliver an error to the reader instead of end-of-stream.
    ///
    /// Buffered bytes are discarded. Does nothing once closed.
    pub fn abort(&mut self, reason: &str) {
        self.buffer.clear();
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(PipeClosed::Aborted(reason.to_string())));
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write after close"));
        }

        let mut written = 0;
        let mut remaining = buf;

        while !remaining.is_empty() {
            let available = self.chunk_size - self.buffer.len();
            let to_write = remaining.len().min(available);

            self.buffer.extend_from_slice(&remaining[..to_write]);
            written += to_write;
            remaining = &remaining[to_write..];

            if self.buffer.len() >= self.chunk_size {
                self.flush_buffer()?;
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(PipeClosed::WriterDropped));
        }
    }
}

/// Reading half. Exactly one per pipe.
pub struct PipeReader {
    rx: mpsc::Receiver<Chunk>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    failure: Option<PipeClosed>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.buffer_pos < self.buffer.len() {
            let available = self.buffer.len() - self.buffer_pos;
            let to_copy = available.min(buf.len());
            buf[..to_copy]
                .copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + to_copy]);
            self.buffer_pos += to_copy;
            return Ok(to_copy);
        }

        if let Some(ref closed) = self.failure {
            return Err(closed.clone().into());
        }

        match self.rx.recv() {
            Ok(Ok(chunk)) => {
                self.buffer = chunk;
                self.buffer_pos = 0;

                let to_copy = self.buffer.len().min(buf.len());
                buf[..to_copy].copy_from_slice(&self.buffer[..to_copy]);
                self.buffer_pos = to_copy;
                Ok(to_copy)
            }
            Ok(Err(closed)) => {
                self.failure = Some(closed.clone());
                Err(closed.into())
            }
            // Sender gone after close(): end of stream.
            Err(_) => Ok(0),
        }
    }
}
