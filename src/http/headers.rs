//! Incremental response-header parsing.
//!
//! The transport hands over one raw header line at a time. Lines are
//! accumulated in a [`ParsedResponseHeader`] until the blank line that ends
//! the block, at which point a [`HttpResponse`] can be materialized.

use crate::base::neterror::NetError;
use crate::http::response::HttpResponse;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode, Version};
use url::Url;

/// Parsed status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
}

/// Header lines of one response block, tagged by completeness.
///
/// `Partial` holds the status line followed by every header line seen so far.
/// `Complete` is reached on the terminating empty line and never reverts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResponseHeader {
    Partial(Vec<Bytes>),
    Complete(Vec<Bytes>),
}

impl Default for ParsedResponseHeader {
    fn default() -> Self {
        ParsedResponseHeader::Partial(Vec::new())
    }
}

impl ParsedResponseHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ParsedResponseHeader::Complete(_))
    }

    pub fn lines(&self) -> &[Bytes] {
        match self {
            ParsedResponseHeader::Partial(lines) | ParsedResponseHeader::Complete(lines) => lines,
        }
    }

    /// Append one raw line (with or without its CRLF).
    ///
    /// A malformed status line fails with `InvalidHttpResponse`; a header line
    /// without a valid `name:` prefix fails with `MalformedHeader`. Appending to
    /// a complete block leaves it unchanged.
    pub fn by_appending_header_line(self, raw: &[u8]) -> Result<Self, NetError> {
        let mut lines = match self {
            ParsedResponseHeader::Complete(_) => return Ok(self),
            ParsedResponseHeader::Partial(lines) => lines,
        };
        let line = strip_line_ending(raw);

        if line.is_empty() {
            if lines.is_empty() {
                // Stray CRLF before the status line
                return Ok(ParsedResponseHeader::Partial(lines));
            }
            return Ok(ParsedResponseHeader::Complete(lines));
        }

        if lines.is_empty() {
            parse_status_line(line)?;
            lines.push(Bytes::copy_from_slice(line));
            return Ok(ParsedResponseHeader::Partial(lines));
        }

        if line[0] == b' ' || line[0] == b'\t' {
            // obs-fold: continuation of the previous header line
            if lines.len() < 2 {
                return Err(NetError::MalformedHeader);
            }
            let last = lines.len() - 1;
            let mut merged = lines[last].to_vec();
            merged.push(b' ');
            merged.extend_from_slice(trim_ows(line));
            lines[last] = Bytes::from(merged);
            return Ok(ParsedResponseHeader::Partial(lines));
        }

        split_header_line(line)?;
        lines.push(Bytes::copy_from_slice(line));
        Ok(ParsedResponseHeader::Partial(lines))
    }

    /// Status line of this block, if one has been seen.
    pub fn status_line(&self) -> Option<StatusLine> {
        self.lines().first().and_then(|l| parse_status_line(l).ok())
    }

    /// Materialize a response. Only valid on a complete block.
    pub fn create_response(&self, url: &Url) -> Result<HttpResponse, NetError> {
        let lines = match self {
            ParsedResponseHeader::Complete(lines) => lines,
            ParsedResponseHeader::Partial(_) => return Err(NetError::InvalidHttpResponse),
        };
        let (first, rest) = lines.split_first().ok_or(NetError::InvalidHttpResponse)?;
        let status_line = parse_status_line(first)?;

        let mut headers = HeaderMap::with_capacity(rest.len());
        for line in rest {
            let (name, value) = split_header_line(line)?;
            let name = HeaderName::from_bytes(name).map_err(|_| NetError::MalformedHeader)?;
            let value = HeaderValue::from_bytes(value).map_err(|_| NetError::MalformedHeader)?;
            headers.append(name, value);
        }

        Ok(HttpResponse::new(
            url.clone(),
            status_line.status,
            status_line.version,
            status_line.reason,
            headers,
        ))
    }
}

/// Parse `HTTP/x.y SP 3DIGIT [SP reason]`.
///
/// `httparse` only knows HTTP/1.x, so an `HTTP/2` or `HTTP/3` start line
/// reported by a multiplexing transport is parsed in its 1.1 shape.
pub fn parse_status_line(line: &[u8]) -> Result<StatusLine, NetError> {
    let line = strip_line_ending(line);
    let (version, rest) = [
        (&b"HTTP/2.0 "[..], Version::HTTP_2),
        (&b"HTTP/2 "[..], Version::HTTP_2),
        (&b"HTTP/3 "[..], Version::HTTP_3),
    ]
    .iter()
    .find_map(|(prefix, v)| line.strip_prefix(*prefix).map(|rest| (Some(*v), rest)))
    .unwrap_or((None, line));

    let mut buf = Vec::with_capacity(rest.len() + 13);
    if version.is_some() {
        buf.extend_from_slice(b"HTTP/1.1 ");
    }
    buf.extend_from_slice(rest);
    buf.extend_from_slice(b"\r\n\r\n");

    let mut no_headers = [httparse::EMPTY_HEADER; 0];
    let mut response = httparse::Response::new(&mut no_headers);
    match response.parse(&buf) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(NetError::InvalidHttpResponse),
    }
    let version = match (version, response.version) {
        (Some(v), _) => v,
        (None, Some(0)) => Version::HTTP_10,
        (None, Some(1)) => Version::HTTP_11,
        _ => return Err(NetError::InvalidHttpResponse),
    };
    let code = response.code.ok_or(NetError::InvalidHttpResponse)?;
    let status = StatusCode::from_u16(code).map_err(|_| NetError::InvalidHttpResponse)?;
    let reason = response.reason.map(|r| r.trim().to_string()).unwrap_or_default();

    Ok(StatusLine {
        version,
        status,
        reason,
    })
}

/// Split `Name: value` into its trimmed parts.
pub fn split_header_line(line: &[u8]) -> Result<(&[u8], &[u8]), NetError> {
    let line = strip_line_ending(line);
    let mut buf = Vec::with_capacity(line.len() + 4);
    buf.extend_from_slice(line);
    buf.extend_from_slice(b"\r\n\r\n");

    let mut parsed = [httparse::EMPTY_HEADER; 1];
    let name_len = match httparse::parse_headers(&buf, &mut parsed) {
        Ok(httparse::Status::Complete((_, [header]))) => header.name.len(),
        _ => return Err(NetError::MalformedHeader),
    };
    // httparse accepts no whitespace between the name and the colon
    Ok((&line[..name_len], trim_ows(&line[name_len + 1..])))
}

pub(crate) fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Trim optional whitespace (SP / HTAB) from both ends.
pub(crate) fn trim_ows(buf: &[u8]) -> &[u8] {
    let start = buf
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(buf.len());
    let end = buf
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map(|i| i + 1)
        .unwrap_or(start);
    &buf[start..end]
}
