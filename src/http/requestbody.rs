//! Request body for POST/PUT operations.

use crate::base::neterror::NetError;
use crate::http::bodysource::{
    stream_channel, BodyStreamSender, FileSource, MemorySource, RequestBodySource, StreamSource,
};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Request body for HTTP methods that send data.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    /// No body (GET, HEAD, DELETE).
    #[default]
    Empty,
    /// Body with raw bytes.
    Bytes(Bytes),
    /// Body read from a file when the transfer starts.
    File(PathBuf),
    /// Body produced through a [`BodyStreamSender`]. It can be opened once.
    Stream(Arc<Mutex<Option<StreamSource>>>),
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Bytes(Bytes::from(s))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(v))
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        RequestBody::Bytes(Bytes::from(s.to_owned()))
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        RequestBody::Bytes(b)
    }
}

impl From<PathBuf> for RequestBody {
    fn from(p: PathBuf) -> Self {
        RequestBody::File(p)
    }
}

impl RequestBody {
    /// Create a streamed body and the sender that feeds it.
    pub fn stream() -> (BodyStreamSender, RequestBody) {
        let (tx, source) = stream_channel();
        (tx, RequestBody::Stream(Arc::new(Mutex::new(Some(source)))))
    }

    /// Check if the body is empty.
    pub fn is_empty(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Bytes(b) => b.is_empty(),
            _ => false,
        }
    }

    /// Length of the body in bytes, `None` for streams and unreadable files.
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::File(p) => std::fs::metadata(p).ok().map(|m| m.len()),
            RequestBody::Stream(_) => None,
        }
    }

    /// Whether both bodies are backed by the same data, so a source opened
    /// for one can be rewound and replayed for the other.
    pub fn shares_source(&self, other: &RequestBody) -> bool {
        match (self, other) {
            (RequestBody::Bytes(a), RequestBody::Bytes(b)) => {
                a.as_ptr() == b.as_ptr() && a.len() == b.len()
            }
            (RequestBody::File(a), RequestBody::File(b)) => a == b,
            (RequestBody::Stream(a), RequestBody::Stream(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Open a source for one transfer attempt.
    ///
    /// `Ok(None)` means there is nothing to send. A stream that was already
    /// opened fails with `UploadStreamRewindNotSupported`.
    pub fn open_source(&self) -> Result<Option<RequestBodySource>, NetError> {
        match self {
            RequestBody::Empty => Ok(None),
            RequestBody::Bytes(b) => Ok(Some(RequestBodySource::Memory(MemorySource::new(
                b.clone(),
            )))),
            RequestBody::File(p) => Ok(Some(RequestBodySource::File(FileSource::open(p)?))),
            RequestBody::Stream(slot) => {
                let source = slot
                    .lock()
                    .map_err(|_| NetError::Failed)?
                    .take()
                    .ok_or(NetError::UploadStreamRewindNotSupported)?;
                Ok(Some(RequestBodySource::Stream(source)))
            }
        }
    }
}
