//! HTTP/1.1 wire codec for the built-in transport.
//!
//! Serializes request heads, frames chunked uploads and splits an inbound
//! byte stream into raw header lines and decoded body bytes.

use crate::base::neterror::NetError;
use crate::http::headers::{parse_status_line, split_header_line, strip_line_ending, trim_ows};
use crate::socket::handle::{BodyLength, TransferConfig};
use crate::socket::proxy::ProxySettings;
use bytes::{BufMut, Bytes, BytesMut};
use http::{header, Method};
use url::Position;

/// Upper bound on one response header block.
pub const MAX_HEADER_BLOCK: usize = 256 * 1024;

/// Longest chunk-size line accepted.
const MAX_CHUNK_LINE: usize = 4096;

/// Terminating chunk of a chunked upload.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Serialize the request line and headers.
///
/// `Host`, `Content-Length`/`Transfer-Encoding` and `Connection` are added
/// unless already present. With a proxy the target is sent in absolute form.
pub fn encode_request_head(
    config: &TransferConfig,
    proxy: Option<&ProxySettings>,
) -> Result<BytesMut, NetError> {
    let url = &config.url;
    let host = url.host_str().ok_or(NetError::InvalidUrl)?;
    let target = match proxy {
        Some(_) => &url[..Position::AfterQuery],
        None => &url[Position::BeforePath..Position::AfterQuery],
    };

    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(config.method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(if target.is_empty() { &b"/"[..] } else { target.as_bytes() });
    buf.put_slice(b" HTTP/1.1\r\n");

    let headers = &config.headers;
    if !headers.contains_key(header::HOST) {
        match url.port() {
            Some(port) => put_header(&mut buf, "host", format!("{}:{}", host, port).as_bytes()),
            None => put_header(&mut buf, "host", host.as_bytes()),
        }
    }

    match config.body_length {
        BodyLength::Known(n) => {
            let implied = n == 0 && (config.method == Method::GET || config.method == Method::HEAD);
            if !implied && !headers.contains_key(header::CONTENT_LENGTH) {
                put_header(&mut buf, "content-length", n.to_string().as_bytes());
            }
        }
        BodyLength::Chunked => {
            if !headers.contains_key(header::TRANSFER_ENCODING) {
                put_header(&mut buf, "transfer-encoding", b"chunked");
            }
        }
        BodyLength::None => {}
    }

    if !headers.contains_key(header::CONNECTION) {
        put_header(&mut buf, "connection", b"close");
    }

    if let Some(auth) = proxy.and_then(|p| p.get_auth_header()) {
        if !headers.contains_key(header::PROXY_AUTHORIZATION) {
            put_header(&mut buf, "proxy-authorization", auth.as_bytes());
        }
    }

    for (name, value) in headers.iter() {
        put_header(&mut buf, name.as_str(), value.as_bytes());
    }
    buf.put_slice(b"\r\n");
    Ok(buf)
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// Frame one chunk of a chunked upload.
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// One unit handed to the transfer callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A raw header line including its line ending. Trailer lines of a
    /// chunked body are delivered this way too.
    HeaderLine(Bytes),
    Body(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Headers,
    Length(u64),
    Chunked(ChunkState),
    CloseDelimited,
    Done,
}

/// Incremental response splitter.
#[derive(Debug)]
pub struct ResponseReader {
    phase: Phase,
    head_request: bool,
    status: Option<u16>,
    content_length: Option<u64>,
    chunked: bool,
    header_bytes: usize,
    seen_any: bool,
}

impl ResponseReader {
    pub fn new(method: &Method) -> Self {
        Self {
            phase: Phase::Headers,
            head_request: *method == Method::HEAD,
            status: None,
            content_length: None,
            chunked: false,
            header_bytes: 0,
            seen_any: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// `Content-Length` of the header block being read, if declared.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Pull the next delivery out of `buf`. `Ok(None)` means more bytes are
    /// needed (or the response is done).
    pub fn next(&mut self, buf: &mut BytesMut) -> Result<Option<Delivery>, NetError> {
        if !buf.is_empty() {
            self.seen_any = true;
        }
        loop {
            match self.phase {
                Phase::Done => return Ok(None),
                Phase::Headers => return self.next_header_line(buf),
                Phase::Length(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(n).freeze();
                    let left = remaining - n as u64;
                    self.phase = if left == 0 {
                        Phase::Done
                    } else {
                        Phase::Length(left)
                    };
                    return Ok(Some(Delivery::Body(data)));
                }
                Phase::CloseDelimited => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(Delivery::Body(buf.split().freeze())));
                }
                Phase::Chunked(state) => match state {
                    ChunkState::Size => {
                        let Some(end) = find_line(buf) else {
                            if buf.len() > MAX_CHUNK_LINE {
                                return Err(NetError::InvalidChunkedEncoding);
                            }
                            return Ok(None);
                        };
                        let line = buf.split_to(end);
                        let size = parse_chunk_size(strip_line_ending(&line))?;
                        self.phase = Phase::Chunked(if size == 0 {
                            ChunkState::Trailers
                        } else {
                            ChunkState::Data(size)
                        });
                    }
                    ChunkState::Data(remaining) => {
                        if buf.is_empty() {
                            return Ok(None);
                        }
                        let n = remaining.min(buf.len() as u64) as usize;
                        let data = buf.split_to(n).freeze();
                        let left = remaining - n as u64;
                        self.phase = Phase::Chunked(if left == 0 {
                            ChunkState::DataEnd
                        } else {
                            ChunkState::Data(left)
                        });
                        return Ok(Some(Delivery::Body(data)));
                    }
                    ChunkState::DataEnd => {
                        if buf.len() < 2 {
                            if buf.first().is_some_and(|&b| b != b'\r' && b != b'\n') {
                                return Err(NetError::InvalidChunkedEncoding);
                            }
                            if buf.first() == Some(&b'\n') {
                                let _ = buf.split_to(1);
                                self.phase = Phase::Chunked(ChunkState::Size);
                                continue;
                            }
                            return Ok(None);
                        }
                        if &buf[..2] == b"\r\n" {
                            let _ = buf.split_to(2);
                        } else if buf[0] == b'\n' {
                            let _ = buf.split_to(1);
                        } else {
                            return Err(NetError::InvalidChunkedEncoding);
                        }
                        self.phase = Phase::Chunked(ChunkState::Size);
                    }
                    ChunkState::Trailers => {
                        let Some(end) = find_line(buf) else {
                            if buf.len() > MAX_HEADER_BLOCK {
                                return Err(NetError::ResponseHeadersTooBig);
                            }
                            return Ok(None);
                        };
                        let line = buf.split_to(end).freeze();
                        if strip_line_ending(&line).is_empty() {
                            self.phase = Phase::Done;
                            return Ok(None);
                        }
                        return Ok(Some(Delivery::HeaderLine(line)));
                    }
                },
            }
        }
    }

    fn next_header_line(&mut self, buf: &mut BytesMut) -> Result<Option<Delivery>, NetError> {
        let Some(end) = find_line(buf) else {
            if self.header_bytes + buf.len() > MAX_HEADER_BLOCK {
                return Err(NetError::ResponseHeadersTooBig);
            }
            return Ok(None);
        };
        self.header_bytes += end;
        if self.header_bytes > MAX_HEADER_BLOCK {
            return Err(NetError::ResponseHeadersTooBig);
        }
        let line = buf.split_to(end).freeze();
        let content = strip_line_ending(&line);

        if self.status.is_none() {
            if !content.is_empty() {
                // A bad status line is reported by the header parser upstream
                self.status = parse_status_line(content)
                    .map(|s| s.status.as_u16())
                    .ok()
                    .or(Some(0));
            }
            return Ok(Some(Delivery::HeaderLine(line)));
        }

        if content.is_empty() {
            self.end_of_block();
            return Ok(Some(Delivery::HeaderLine(line)));
        }

        if let Ok((name, value)) = split_header_line(content) {
            if name.eq_ignore_ascii_case(b"content-length") {
                let parsed = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or(NetError::InvalidResponse)?;
                if self.content_length.is_some_and(|prev| prev != parsed) {
                    return Err(NetError::InvalidResponse);
                }
                self.content_length = Some(parsed);
            } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
                self.chunked = value
                    .rsplit(|&b| b == b',')
                    .next()
                    .map(trim_ows)
                    .is_some_and(|last| last.eq_ignore_ascii_case(b"chunked"));
            }
        }
        Ok(Some(Delivery::HeaderLine(line)))
    }

    fn end_of_block(&mut self) {
        let status = self.status.unwrap_or(0);
        if (100..200).contains(&status) && status != 101 {
            self.status = None;
            self.content_length = None;
            self.chunked = false;
            self.header_bytes = 0;
            return;
        }

        self.phase = if self.head_request || status == 101 || status == 204 || status == 304 {
            Phase::Done
        } else if self.chunked {
            Phase::Chunked(ChunkState::Size)
        } else {
            match self.content_length {
                Some(0) => Phase::Done,
                Some(n) => Phase::Length(n),
                None => Phase::CloseDelimited,
            }
        };
    }

    /// Called once the peer closed the connection and every buffered byte
    /// has been delivered.
    pub fn finish_on_eof(&mut self) -> Result<(), NetError> {
        let result = match self.phase {
            Phase::Done | Phase::CloseDelimited => Ok(()),
            Phase::Headers if !self.seen_any => Err(NetError::EmptyResponse),
            Phase::Headers => Err(NetError::InvalidHttpResponse),
            Phase::Length(_) => Err(NetError::ContentLengthMismatch),
            Phase::Chunked(_) => Err(NetError::IncompleteChunkedEncoding),
        };
        self.phase = Phase::Done;
        result
    }
}

/// Offset just past the next `\n`.
fn find_line(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n').map(|i| i + 1)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, NetError> {
    let mut normalized = Vec::with_capacity(line.len() + 2);
    normalized.extend_from_slice(line);
    normalized.extend_from_slice(b"\r\n");
    match httparse::parse_chunk_size(&normalized) {
        Ok(httparse::Status::Complete((_, size))) => Ok(size),
        _ => Err(NetError::InvalidChunkedEncoding),
    }
}
