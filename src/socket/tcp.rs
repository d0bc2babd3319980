//! Built-in HTTP/1.1 transport over non-blocking tokio sockets.
//!
//! One connection per transfer, `Connection: close` semantics. Connects are
//! driven through the write watcher of the transfer's socket; reads and
//! writes use `try_read`/`try_write` after the multiplexer saw readiness.

use crate::base::context::{net_error_from_io, IoResultExt};
use crate::base::neterror::NetError;
use crate::http::bodysource::BodyChunk;
use crate::http::headers::strip_line_ending;
use crate::http::wire::{self, Delivery, ResponseReader, LAST_CHUNK};
use crate::socket::handle::{BodyLength, TransferConfig};
use crate::socket::proxy::ProxyType;
use crate::socket::transport::{
    HandleAction, PauseState, Readiness, SocketId, SocketInterest, SocketUpdate, TransferEvents,
    TransferId, Transport, Trigger,
};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;

/// Chromium's per-host socket limit.
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 6;

/// Largest outbound body pull.
const UPLOAD_CHUNK: usize = 16 * 1024;

type ConnectFuture = Pin<Box<dyn Future<Output = Result<TcpStream, NetError>> + Send>>;

enum Conn {
    /// Waiting for a free per-host slot.
    Queued,
    /// Slot granted, connect not started yet.
    Start,
    Connecting(ConnectFuture),
    Connected(TcpStream),
    Failed(NetError),
    Closed,
}

#[derive(Debug, Default)]
struct HostSlots {
    active: usize,
    waiting: VecDeque<TransferId>,
}

struct TcpTransfer {
    socket: SocketId,
    host_key: String,
    connect_host: String,
    connect_port: u16,
    conn: Conn,
    out: BytesMut,
    body_length: BodyLength,
    body_sent: u64,
    body_done: bool,
    recv: BytesMut,
    reader: ResponseReader,
    held: Option<Delivery>,
    eof: bool,
    pause: PauseState,
    reported: Option<SocketInterest>,
    read_size: usize,
    verbose: bool,
    debug_output: bool,
    finished: bool,
}

pub struct TcpTransport {
    transfers: HashMap<TransferId, TcpTransfer>,
    sockets: HashMap<SocketId, TransferId>,
    hosts: HashMap<String, HostSlots>,
    max_per_host: usize,
    next_socket: u64,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            transfers: HashMap::new(),
            sockets: HashMap::new(),
            hosts: HashMap::new(),
            max_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            next_socket: 1,
        }
    }

    pub fn with_max_connections_per_host(mut self, max: usize) -> Self {
        self.max_per_host = max.max(1);
        self
    }

    /// Transfers currently holding a connection slot for `host:port`.
    pub fn active_for_host(&self, host_key: &str) -> usize {
        self.hosts.get(host_key).map_or(0, |s| s.active)
    }

    /// Give back the per-host slot of a transfer that left. Returns the
    /// queued transfer promoted into the slot, if any.
    fn release_slot(&mut self, id: TransferId, transfer: &TcpTransfer) -> Option<TransferId> {
        let slots = self.hosts.get_mut(&transfer.host_key)?;
        let mut promoted = None;
        if matches!(transfer.conn, Conn::Queued) {
            slots.waiting.retain(|w| *w != id);
        } else {
            slots.active = slots.active.saturating_sub(1);
            while let Some(next) = slots.waiting.pop_front() {
                if let Some(queued) = self.transfers.get_mut(&next) {
                    queued.conn = Conn::Start;
                    slots.active += 1;
                    promoted = Some(next);
                    break;
                }
            }
        }
        if slots.active == 0 && slots.waiting.is_empty() {
            self.hosts.remove(&transfer.host_key);
        }
        promoted
    }

    fn drive(&mut self, id: TransferId, events: &mut dyn TransferEvents) {
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };
        if transfer.finished {
            return;
        }
        if let Err(error) = transfer.step(id, events) {
            transfer.complete(id, events, Err(error));
        }
    }
}

impl TcpTransfer {
    fn step(&mut self, id: TransferId, events: &mut dyn TransferEvents) -> Result<(), NetError> {
        match self.conn {
            Conn::Queued | Conn::Connecting(_) | Conn::Closed => Ok(()),
            Conn::Failed(error) => Err(error),
            Conn::Start => {
                tracing::debug!(
                    transfer = %id,
                    host = %self.connect_host,
                    port = self.connect_port,
                    "connecting"
                );
                self.conn = Conn::Connecting(connect(self.connect_host.clone(), self.connect_port));
                Ok(())
            }
            Conn::Connected(_) => {
                self.write(id, events)?;
                self.read(id, events)
            }
        }
    }

    fn write(&mut self, id: TransferId, events: &mut dyn TransferEvents) -> Result<(), NetError> {
        loop {
            if self.out.is_empty() {
                if self.body_done || self.pause.send {
                    return Ok(());
                }
                self.fill_outbound(id, events)?;
                if self.out.is_empty() {
                    return Ok(());
                }
            }
            let Conn::Connected(stream) = &self.conn else {
                return Ok(());
            };
            match stream.try_write(&self.out) {
                Ok(n) => {
                    if self.debug_output {
                        tracing::trace!(transfer = %id, bytes = n, "sent");
                    }
                    self.out.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(net_error_from_io(&e)),
            }
        }
    }

    fn fill_outbound(
        &mut self,
        id: TransferId,
        events: &mut dyn TransferEvents,
    ) -> Result<(), NetError> {
        let remaining = match self.body_length {
            BodyLength::Known(n) => n.saturating_sub(self.body_sent),
            _ => u64::MAX,
        };
        let max = remaining.min(UPLOAD_CHUNK as u64) as usize;

        match events.on_need_outbound(id, max) {
            BodyChunk::Data(mut data) => {
                data.truncate(max);
                self.body_sent += data.len() as u64;
                if self.body_length == BodyLength::Chunked {
                    wire::encode_chunk(&data, &mut self.out);
                } else {
                    self.out.put_slice(&data);
                }
                if let BodyLength::Known(n) = self.body_length {
                    self.body_done = self.body_sent >= n;
                }
            }
            BodyChunk::Done => {
                if let BodyLength::Known(n) = self.body_length {
                    if self.body_sent < n {
                        return Err(NetError::ContentLengthMismatch);
                    }
                }
                if self.body_length == BodyLength::Chunked {
                    self.out.put_slice(LAST_CHUNK);
                }
                self.body_done = true;
            }
            BodyChunk::RetryLater => self.pause.send = true,
            BodyChunk::Error(e) => return Err(e),
        }
        Ok(())
    }

    fn read(&mut self, id: TransferId, events: &mut dyn TransferEvents) -> Result<(), NetError> {
        loop {
            if !self.deliver(id, events)? {
                return Ok(());
            }
            if self.eof {
                let result = self.reader.finish_on_eof();
                self.complete(id, events, result);
                return Ok(());
            }
            let Conn::Connected(stream) = &self.conn else {
                return Ok(());
            };
            self.recv.reserve(self.read_size);
            match stream.try_read_buf(&mut self.recv) {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    if self.debug_output {
                        tracing::trace!(transfer = %id, bytes = n, "received");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(net_error_from_io(&e)),
            }
        }
    }

    /// Hand buffered deliveries to the callbacks. Returns `false` when no
    /// further reading should happen now.
    fn deliver(&mut self, id: TransferId, events: &mut dyn TransferEvents) -> Result<bool, NetError> {
        loop {
            if self.finished || self.pause.receive {
                return Ok(false);
            }
            let delivery = match self.held.take() {
                Some(d) => d,
                None => match self.reader.next(&mut self.recv)? {
                    Some(d) => d,
                    None => break,
                },
            };
            let action = match &delivery {
                Delivery::HeaderLine(line) => {
                    if self.verbose {
                        tracing::debug!(
                            transfer = %id,
                            "< {}",
                            String::from_utf8_lossy(strip_line_ending(line))
                        );
                    }
                    events.on_header_data(id, line, self.reader.content_length())
                }
                Delivery::Body(data) => events.on_body_data(id, data),
            };
            match action {
                HandleAction::Proceed => {}
                HandleAction::Pause => {
                    self.held = Some(delivery);
                    self.pause.receive = true;
                    return Ok(false);
                }
                HandleAction::Abort => return Err(NetError::ConnectionAborted),
            }
        }
        if self.reader.is_done() {
            self.complete(id, events, Ok(()));
            return Ok(false);
        }
        Ok(true)
    }

    fn complete(
        &mut self,
        id: TransferId,
        events: &mut dyn TransferEvents,
        result: Result<(), NetError>,
    ) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.conn = Conn::Closed;
        if let Err(e) = &result {
            tracing::debug!(transfer = %id, error = %e, "transfer failed");
        }
        events.on_transfer_complete(id, result);
    }

    fn interest(&self) -> SocketInterest {
        if self.finished {
            return SocketInterest::Remove;
        }
        match &self.conn {
            Conn::Connecting(_) => SocketInterest::Write,
            Conn::Connected(_) => SocketInterest::from_flags(
                !self.pause.receive && !self.eof && !self.reader.is_done(),
                !self.pause.send && (!self.out.is_empty() || !self.body_done),
            ),
            // Start needs a timeout trigger, not a watcher
            Conn::Queued | Conn::Start | Conn::Failed(_) | Conn::Closed => SocketInterest::Remove,
        }
    }

    /// Report the interest if it changed since the last report.
    fn interest_update(&mut self) -> Option<SocketUpdate> {
        let interest = self.interest();
        let changed = match (self.reported, interest) {
            (None, SocketInterest::Remove) => false,
            (Some(prev), now) => prev != now,
            (None, _) => true,
        };
        if !changed {
            return None;
        }
        self.reported = (interest != SocketInterest::Remove).then_some(interest);
        Some(SocketUpdate {
            socket: self.socket,
            interest,
        })
    }
}

fn connect(host: String, port: u16) -> ConnectFuture {
    Box::pin(async move {
        let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .dns_context(&host)?
            .collect();
        let mut last_error = NetError::NameNotResolved;
        for addr in addrs {
            match TcpStream::connect(addr).await.connection_context(&host, port) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    })
}

impl Transport for TcpTransport {
    fn add(&mut self, id: TransferId, config: &TransferConfig) -> Result<(), NetError> {
        match config.url.scheme() {
            "http" => {}
            // TLS is not provided by this transport
            "https" => return Err(NetError::DisallowedUrlScheme),
            _ => return Err(NetError::UnknownUrlScheme),
        }
        let host = config.url.host_str().ok_or(NetError::InvalidUrl)?;
        let proxy = config
            .proxy
            .as_ref()
            .filter(|p| !p.should_bypass(&config.url));

        let (connect_host, connect_port) = match proxy {
            Some(p) => {
                if p.proxy_type() != ProxyType::Http {
                    return Err(NetError::ProxyConnectionFailed);
                }
                let (h, port) = p.host_port().ok_or(NetError::ProxyConnectionFailed)?;
                (h.to_string(), port)
            }
            None => (
                host.to_string(),
                config.url.port_or_known_default().ok_or(NetError::InvalidUrl)?,
            ),
        };
        let connect_host = connect_host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let head = wire::encode_request_head(config, proxy)?;
        if config.verbose {
            for line in head[..].split(|&b| b == b'\n') {
                let line = strip_line_ending(line);
                if !line.is_empty() {
                    tracing::debug!(transfer = %id, "> {}", String::from_utf8_lossy(line));
                }
            }
        }

        let host_key = format!("{}:{}", connect_host, connect_port);
        let slots = self.hosts.entry(host_key.clone()).or_default();
        let conn = if slots.active < self.max_per_host {
            slots.active += 1;
            Conn::Start
        } else {
            tracing::trace!(transfer = %id, host = %host_key, "waiting for connection slot");
            slots.waiting.push_back(id);
            Conn::Queued
        };

        let socket = SocketId(self.next_socket);
        self.next_socket += 1;
        self.sockets.insert(socket, id);
        self.transfers.insert(
            id,
            TcpTransfer {
                socket,
                host_key,
                connect_host,
                connect_port,
                conn,
                out: head,
                body_length: config.body_length,
                body_sent: 0,
                body_done: matches!(config.body_length, BodyLength::None | BodyLength::Known(0)),
                recv: BytesMut::new(),
                reader: ResponseReader::new(&config.method),
                held: None,
                eof: false,
                pause: PauseState::default(),
                reported: None,
                read_size: config.receive_buffer_size.max(1),
                verbose: config.verbose,
                debug_output: config.debug_output,
                finished: false,
            },
        );
        Ok(())
    }

    fn remove(&mut self, id: TransferId) -> Vec<SocketUpdate> {
        let Some(transfer) = self.transfers.remove(&id) else {
            return Vec::new();
        };
        self.sockets.remove(&transfer.socket);
        self.release_slot(id, &transfer);
        match transfer.reported {
            Some(_) => vec![SocketUpdate {
                socket: transfer.socket,
                interest: SocketInterest::Remove,
            }],
            None => Vec::new(),
        }
    }

    fn set_pause(&mut self, id: TransferId, pause: PauseState) -> Vec<SocketUpdate> {
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return Vec::new();
        };
        transfer.pause = pause;
        transfer.interest_update().into_iter().collect()
    }

    fn socket_action(
        &mut self,
        trigger: Trigger,
        events: &mut dyn TransferEvents,
    ) -> Result<Vec<SocketUpdate>, NetError> {
        let mut queue: Vec<TransferId> = match trigger {
            Trigger::Timeout => self.transfers.keys().copied().collect(),
            Trigger::Socket(socket, _) => self.sockets.get(&socket).copied().into_iter().collect(),
        };
        let mut updates = Vec::new();

        while !queue.is_empty() {
            for id in std::mem::take(&mut queue) {
                self.drive(id, events);
            }
            let finished: Vec<TransferId> = self
                .transfers
                .iter()
                .filter(|(_, t)| t.finished)
                .map(|(id, _)| *id)
                .collect();
            for id in finished {
                let Some(transfer) = self.transfers.remove(&id) else {
                    continue;
                };
                self.sockets.remove(&transfer.socket);
                if transfer.reported.is_some() {
                    updates.push(SocketUpdate {
                        socket: transfer.socket,
                        interest: SocketInterest::Remove,
                    });
                }
                if let Some(next) = self.release_slot(id, &transfer) {
                    queue.push(next);
                }
            }
        }

        updates.extend(self.transfers.values_mut().filter_map(|t| t.interest_update()));
        Ok(updates)
    }

    fn poll_socket(
        &mut self,
        socket: SocketId,
        readiness: Readiness,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        let Some(transfer) = self
            .sockets
            .get(&socket)
            .and_then(|id| self.transfers.get_mut(id))
        else {
            return Poll::Pending;
        };

        match readiness {
            Readiness::Writable => {
                if let Conn::Connecting(fut) = &mut transfer.conn {
                    let result = match fut.as_mut().poll(cx) {
                        Poll::Ready(result) => result,
                        Poll::Pending => return Poll::Pending,
                    };
                    transfer.conn = match result {
                        Ok(stream) => Conn::Connected(stream),
                        Err(e) => Conn::Failed(e),
                    };
                    return Poll::Ready(());
                }
                match &transfer.conn {
                    Conn::Connected(stream) => stream.poll_write_ready(cx).map(|_| ()),
                    _ => Poll::Pending,
                }
            }
            Readiness::Readable => match &transfer.conn {
                Conn::Connected(stream) => stream.poll_read_ready(cx).map(|_| ()),
                _ => Poll::Pending,
            },
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.transfers
            .values()
            .any(|t| matches!(t.conn, Conn::Start) && !t.finished)
            .then_some(Duration::ZERO)
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("transfers", &self.transfers.len())
            .field("hosts", &self.hosts.len())
            .field("max_per_host", &self.max_per_host)
            .finish()
    }
}
