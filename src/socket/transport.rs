//! The boundary between the multiplexer and the socket transport.
//!
//! A [`Transport`] owns the actual sockets. It reports which sockets it wants
//! watched through [`SocketUpdate`]s and does its work inside
//! [`Transport::socket_action`], calling back into [`TransferEvents`].

use crate::base::neterror::NetError;
use crate::http::bodysource::BodyChunk;
use crate::socket::handle::TransferConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    pub(crate) fn next() -> Self {
        TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-assigned socket identity. Several transfers may share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketInterest {
    Read,
    Write,
    ReadWrite,
    Remove,
}

impl SocketInterest {
    pub fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (true, true) => SocketInterest::ReadWrite,
            (true, false) => SocketInterest::Read,
            (false, true) => SocketInterest::Write,
            (false, false) => SocketInterest::Remove,
        }
    }

    pub fn needs_read(&self) -> bool {
        matches!(self, SocketInterest::Read | SocketInterest::ReadWrite)
    }

    pub fn needs_write(&self) -> bool {
        matches!(self, SocketInterest::Write | SocketInterest::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketUpdate {
    pub socket: SocketId,
    pub interest: SocketInterest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Readiness {
    Readable,
    Writable,
}

/// What woke the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Socket(SocketId, Readiness),
    Timeout,
}

/// Answer to a header or body callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleAction {
    Abort,
    Proceed,
    /// Stop receiving. The bytes just offered were not consumed and are
    /// offered again after the receive direction is resumed.
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PauseState {
    pub receive: bool,
    pub send: bool,
}

impl PauseState {
    pub fn any(&self) -> bool {
        self.receive || self.send
    }
}

/// Byte-level callbacks, invoked during a pump pass.
pub trait TransferEvents {
    /// One raw header line. `content_length` is the length declared by the
    /// header block so far.
    fn on_header_data(
        &mut self,
        id: TransferId,
        line: &[u8],
        content_length: Option<u64>,
    ) -> HandleAction;

    fn on_body_data(&mut self, id: TransferId, data: &[u8]) -> HandleAction;

    /// Pull up to `max` outbound body bytes.
    fn on_need_outbound(&mut self, id: TransferId, max: usize) -> BodyChunk;

    fn on_seek(&mut self, id: TransferId, position: u64) -> bool;

    /// Delivered exactly once per added transfer, unless it was removed first.
    fn on_transfer_complete(&mut self, id: TransferId, result: Result<(), NetError>);
}

/// A socket-multiplexing transport in the style of a curl multi handle.
///
/// Answering `Pause` to a data callback or `RetryLater` to an outbound pull
/// pauses that direction inside the transport; it resumes only through
/// [`Transport::set_pause`].
pub trait Transport: Send + 'static {
    fn add(&mut self, id: TransferId, config: &TransferConfig) -> Result<(), NetError>;

    /// Drop a transfer without reporting its completion.
    fn remove(&mut self, id: TransferId) -> Vec<SocketUpdate>;

    fn set_pause(&mut self, id: TransferId, pause: PauseState) -> Vec<SocketUpdate>;

    /// Process pending work. A socket trigger concerns the transfers on that
    /// socket; a timeout concerns all of them. `Err` is a fatal,
    /// multiplexer-level failure.
    fn socket_action(
        &mut self,
        trigger: Trigger,
        events: &mut dyn TransferEvents,
    ) -> Result<Vec<SocketUpdate>, NetError>;

    /// Readiness watcher for one direction of one socket.
    fn poll_socket(&mut self, socket: SocketId, readiness: Readiness, cx: &mut Context<'_>)
        -> Poll<()>;

    /// How soon the transport itself wants a timeout trigger.
    fn timeout(&self) -> Option<Duration>;
}
