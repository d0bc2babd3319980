//! Snapshot of one in-flight exchange.
//!
//! Every transformation consumes the current [`TransferState`] and returns the
//! next one. A redirect drops the snapshot and starts from a fresh one.

use crate::base::neterror::NetError;
use crate::http::bodysource::RequestBodySource;
use crate::http::drain::{DataDrain, DrainResult};
use crate::http::headers::ParsedResponseHeader;
use crate::http::response::HttpResponse;
use url::Url;

#[derive(Debug)]
pub struct TransferState {
    url: Url,
    parsed_header: ParsedResponseHeader,
    response: Option<HttpResponse>,
    body_source: Option<RequestBodySource>,
    drain: DataDrain,
    received: u64,
}

/// Everything left over once an attempt is done.
#[derive(Debug)]
pub struct FinishedTransfer {
    pub response: Option<HttpResponse>,
    pub body: DrainResult,
    pub body_source: Option<RequestBodySource>,
}

impl TransferState {
    pub fn new(url: Url, body_source: Option<RequestBodySource>, drain: DataDrain) -> Self {
        Self {
            url,
            parsed_header: ParsedResponseHeader::new(),
            response: None,
            body_source,
            drain,
            received: 0,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_header_complete(&self) -> bool {
        self.response.is_some()
    }

    pub fn parsed_header(&self) -> &ParsedResponseHeader {
        &self.parsed_header
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    pub fn drain(&self) -> &DataDrain {
        &self.drain
    }

    /// Body bytes folded into the drain during this attempt.
    pub fn received_body_bytes(&self) -> u64 {
        self.received
    }

    pub fn body_source_mut(&mut self) -> Option<&mut RequestBodySource> {
        self.body_source.as_mut()
    }

    /// Fold one raw header line into the snapshot.
    ///
    /// An interim 1xx block (other than 101) is discarded and parsing starts
    /// over for the next block. Lines arriving after the final block is
    /// complete (trailers) leave the snapshot unchanged.
    pub fn by_appending_header_line(self, line: &[u8]) -> Result<Self, NetError> {
        if self.response.is_some() {
            return Ok(self);
        }
        let parsed = self.parsed_header.by_appending_header_line(line)?;
        if !parsed.is_complete() {
            return Ok(Self {
                parsed_header: parsed,
                ..self
            });
        }

        let status = parsed
            .status_line()
            .ok_or(NetError::InvalidHttpResponse)?
            .status;
        if status.is_informational() && status.as_u16() != 101 {
            tracing::trace!(status = status.as_u16(), "interim response block");
            return Ok(Self {
                parsed_header: ParsedResponseHeader::new(),
                ..self
            });
        }

        let response = parsed.create_response(&self.url)?;
        Ok(Self {
            parsed_header: parsed,
            response: Some(response),
            ..self
        })
    }

    /// Fold body bytes into the drain. Headers must be complete.
    pub fn by_appending_body_data(mut self, data: &[u8]) -> Result<Self, NetError> {
        if self.response.is_none() {
            return Err(NetError::InvalidHttpResponse);
        }
        self.drain.append(data)?;
        self.received += data.len() as u64;
        Ok(self)
    }

    pub fn finish(self) -> Result<FinishedTransfer, NetError> {
        Ok(FinishedTransfer {
            response: self.response,
            body: self.drain.finish()?,
            body_source: self.body_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::drain::DrainKind;
    use bytes::Bytes;
    use http::StatusCode;

    fn state() -> TransferState {
        TransferState::new(
            Url::parse("http://example.com/x").unwrap(),
            None,
            DrainKind::Memory.create(),
        )
    }

    #[test]
    fn test_headers_then_body() {
        let s = state()
            .by_appending_header_line(b"HTTP/1.1 200 OK")
            .unwrap()
            .by_appending_header_line(b"Content-Type: text/plain")
            .unwrap();
        assert!(!s.is_header_complete());

        let s = s.by_appending_header_line(b"").unwrap();
        assert!(s.is_header_complete());
        let resp = s.response().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.header("Content-Type"), Some("text/plain"));
        assert_eq!(resp.url().as_str(), "http://example.com/x");

        let s = s
            .by_appending_body_data(b"abc")
            .unwrap()
            .by_appending_body_data(b"def")
            .unwrap();
        assert_eq!(s.received_body_bytes(), 6);
        let done = s.finish().unwrap();
        assert_eq!(done.body, DrainResult::Memory(Bytes::from_static(b"abcdef")));
    }

    #[test]
    fn test_body_before_headers_rejected() {
        let err = state().by_appending_body_data(b"x").unwrap_err();
        assert_eq!(err, NetError::InvalidHttpResponse);
    }

    #[test]
    fn test_interim_block_resets() {
        let s = state()
            .by_appending_header_line(b"HTTP/1.1 100 Continue\r\n")
            .unwrap()
            .by_appending_header_line(b"\r\n")
            .unwrap();
        assert!(!s.is_header_complete());
        assert!(s.parsed_header().lines().is_empty());

        let s = s
            .by_appending_header_line(b"HTTP/1.1 201 Created\r\n")
            .unwrap()
            .by_appending_header_line(b"\r\n")
            .unwrap();
        assert_eq!(s.response().unwrap().status(), StatusCode::CREATED);
    }

    #[test]
    fn test_trailers_ignored() {
        let s = state()
            .by_appending_header_line(b"HTTP/1.1 200 OK")
            .unwrap()
            .by_appending_header_line(b"")
            .unwrap()
            .by_appending_header_line(b"X-Checksum: abc")
            .unwrap();
        assert!(s.response().unwrap().header("x-checksum").is_none());
        assert_eq!(s.parsed_header().lines().len(), 1);
    }

    #[test]
    fn test_malformed_start_line_fails() {
        let err = state()
            .by_appending_header_line(b"ICY 200 OK")
            .unwrap_err();
        assert_eq!(err, NetError::InvalidHttpResponse);
    }
}
