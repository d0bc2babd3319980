//! Pull-based request body sources.
//!
//! The transport asks for at most `max` bytes at a time and gets back one of
//! [`BodyChunk`]. A source that has nothing right now answers `RetryLater` and
//! later fires its data-available handler so the consumer can poll again.

use crate::base::context::{net_error_from_io, IoResultExt};
use crate::base::neterror::NetError;
use bytes::Bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Size of a single read from a file-backed body.
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// One answer to a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyChunk {
    Data(Bytes),
    Done,
    RetryLater,
    Error(NetError),
}

/// Invoked when a source that answered `RetryLater` has bytes again.
pub type DataAvailableHandler = Arc<dyn Fn() + Send + Sync>;

pub trait BodySource: Send {
    /// Pull at most `max` bytes.
    fn next_chunk(&mut self, max: usize) -> BodyChunk;

    /// Reposition the cursor. Returns `false` when the source cannot rewind.
    fn seek_to(&mut self, position: u64) -> bool;

    /// Total length, if known up front.
    fn len(&self) -> Option<u64>;

    fn set_data_available_handler(&mut self, _handler: DataAvailableHandler) {}
}

/// Fixed in-memory buffer with a cursor.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    cursor: usize,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            cursor: 0,
        }
    }
}

impl BodySource for MemorySource {
    fn next_chunk(&mut self, max: usize) -> BodyChunk {
        if self.cursor >= self.data.len() {
            return BodyChunk::Done;
        }
        let end = self.cursor + max.max(1).min(self.data.len() - self.cursor);
        let chunk = self.data.slice(self.cursor..end);
        self.cursor = end;
        BodyChunk::Data(chunk)
    }

    fn seek_to(&mut self, position: u64) -> bool {
        match usize::try_from(position) {
            Ok(pos) if pos <= self.data.len() => {
                self.cursor = pos;
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// File read in fixed-size chunks.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: File,
    len: u64,
    done: bool,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NetError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).file_context(&path)?;
        let len = file.metadata().file_context(&path)?.len();
        Ok(Self {
            path,
            file,
            len,
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BodySource for FileSource {
    fn next_chunk(&mut self, max: usize) -> BodyChunk {
        if self.done {
            return BodyChunk::Done;
        }
        let mut buf = vec![0u8; max.clamp(1, FILE_CHUNK_SIZE)];
        match self.file.read(&mut buf) {
            Ok(0) => {
                self.done = true;
                BodyChunk::Done
            }
            Ok(n) => {
                buf.truncate(n);
                BodyChunk::Data(Bytes::from(buf))
            }
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "body file read failed");
                BodyChunk::Error(net_error_from_io(&e))
            }
        }
    }

    fn seek_to(&mut self, position: u64) -> bool {
        match self.file.seek(SeekFrom::Start(position)) {
            Ok(_) => {
                self.done = false;
                true
            }
            Err(_) => false,
        }
    }

    fn len(&self) -> Option<u64> {
        Some(self.len)
    }
}

type SharedHandler = Arc<Mutex<Option<DataAvailableHandler>>>;

fn notify(handler: &SharedHandler) {
    let callback = match handler.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    };
    if let Some(callback) = callback {
        callback();
    }
}

/// Write half of a streamed request body.
///
/// Dropping the sender ends the body.
pub struct BodyStreamSender {
    tx: mpsc::UnboundedSender<Result<Bytes, NetError>>,
    handler: SharedHandler,
}

impl BodyStreamSender {
    /// Queue more body bytes. Fails with `ConnectionClosed` once the
    /// transfer has stopped reading.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), NetError> {
        self.tx
            .send(Ok(data.into()))
            .map_err(|_| NetError::ConnectionClosed)?;
        notify(&self.handler);
        Ok(())
    }

    /// Fail the body with `error`.
    pub fn abort(self, error: NetError) {
        let _ = self.tx.send(Err(error));
    }
}

impl Drop for BodyStreamSender {
    fn drop(&mut self) {
        notify(&self.handler);
    }
}

impl std::fmt::Debug for BodyStreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStreamSender").finish_non_exhaustive()
    }
}

/// Read half of a streamed request body. One-shot: it cannot rewind.
pub struct StreamSource {
    rx: mpsc::UnboundedReceiver<Result<Bytes, NetError>>,
    pending: Option<Bytes>,
    terminal: Option<BodyChunk>,
    handler: SharedHandler,
}

/// Create a connected sender/source pair.
pub fn stream_channel() -> (BodyStreamSender, StreamSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: SharedHandler = Arc::new(Mutex::new(None));
    (
        BodyStreamSender {
            tx,
            handler: handler.clone(),
        },
        StreamSource {
            rx,
            pending: None,
            terminal: None,
            handler,
        },
    )
}

impl StreamSource {
    fn split(&mut self, mut data: Bytes, max: usize) -> BodyChunk {
        let max = max.max(1);
        if data.len() > max {
            self.pending = Some(data.split_off(max));
        }
        BodyChunk::Data(data)
    }
}

impl BodySource for StreamSource {
    fn next_chunk(&mut self, max: usize) -> BodyChunk {
        if let Some(terminal) = &self.terminal {
            return terminal.clone();
        }
        if let Some(data) = self.pending.take() {
            return self.split(data, max);
        }
        match self.rx.try_recv() {
            Ok(Ok(data)) if data.is_empty() => BodyChunk::RetryLater,
            Ok(Ok(data)) => self.split(data, max),
            Ok(Err(e)) => {
                self.terminal = Some(BodyChunk::Error(e));
                BodyChunk::Error(e)
            }
            Err(mpsc::error::TryRecvError::Empty) => BodyChunk::RetryLater,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.terminal = Some(BodyChunk::Done);
                BodyChunk::Done
            }
        }
    }

    fn seek_to(&mut self, _position: u64) -> bool {
        false
    }

    fn len(&self) -> Option<u64> {
        None
    }

    fn set_data_available_handler(&mut self, handler: DataAvailableHandler) {
        if let Ok(mut guard) = self.handler.lock() {
            *guard = Some(handler);
        }
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("pending", &self.pending.as_ref().map(|b| b.len()))
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

/// The closed set of outbound body variants.
#[derive(Debug)]
pub enum RequestBodySource {
    Memory(MemorySource),
    File(FileSource),
    Stream(StreamSource),
}

impl RequestBodySource {
    pub fn is_rewindable(&self) -> bool {
        !matches!(self, RequestBodySource::Stream(_))
    }
}

impl BodySource for RequestBodySource {
    fn next_chunk(&mut self, max: usize) -> BodyChunk {
        match self {
            RequestBodySource::Memory(s) => s.next_chunk(max),
            RequestBodySource::File(s) => s.next_chunk(max),
            RequestBodySource::Stream(s) => s.next_chunk(max),
        }
    }

    fn seek_to(&mut self, position: u64) -> bool {
        match self {
            RequestBodySource::Memory(s) => s.seek_to(position),
            RequestBodySource::File(s) => s.seek_to(position),
            RequestBodySource::Stream(s) => s.seek_to(position),
        }
    }

    fn len(&self) -> Option<u64> {
        match self {
            RequestBodySource::Memory(s) => s.len(),
            RequestBodySource::File(s) => s.len(),
            RequestBodySource::Stream(s) => s.len(),
        }
    }

    fn set_data_available_handler(&mut self, handler: DataAvailableHandler) {
        if let RequestBodySource::Stream(s) = self {
            s.set_data_available_handler(handler);
        }
    }
}
