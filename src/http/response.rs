//! HTTP response metadata.

use http::{header, HeaderMap, StatusCode, Version};
use url::Url;

/// Response produced once a header block is complete.
/// The body is not part of the response; it lives in the task's drain.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    url: Url,
    status: StatusCode,
    version: Version,
    reason: String,
    headers: HeaderMap,
}

impl HttpResponse {
    pub fn new(
        url: Url,
        status: StatusCode,
        version: Version,
        reason: String,
        headers: HeaderMap,
    ) -> Self {
        Self {
            url,
            status,
            version,
            reason,
            headers,
        }
    }

    /// Final effective URL of the attempt that produced this response.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get a reference to the headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if it is valid visible ASCII.
    /// Names are matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Declared `Content-Length`, `None` when absent or unparsable.
    pub fn expected_content_length(&self) -> Option<u64> {
        self.header(header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    pub fn location(&self) -> Option<&str> {
        self.header(header::LOCATION.as_str())
    }

    /// A redirect only counts when it is 3xx and carries a `Location`.
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection() && self.location().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn response(status: u16, headers: &[(&'static str, &'static str)]) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.append(*k, HeaderValue::from_static(v));
        }
        HttpResponse::new(
            Url::parse("http://example.com/").unwrap(),
            StatusCode::from_u16(status).unwrap(),
            Version::HTTP_11,
            String::new(),
            map,
        )
    }

    #[test]
    fn test_redirect_requires_location() {
        assert!(response(302, &[("location", "/next")]).is_redirect());
        assert!(!response(302, &[]).is_redirect());
        assert!(!response(200, &[("location", "/next")]).is_redirect());
    }

    #[test]
    fn test_content_length() {
        assert_eq!(
            response(200, &[("content-length", "42")]).expected_content_length(),
            Some(42)
        );
        assert_eq!(response(200, &[]).expected_content_length(), None);
    }

    #[test]
    fn test_mime_type_strips_parameters() {
        let r = response(200, &[("content-type", "text/html; charset=utf-8")]);
        assert_eq!(r.mime_type(), Some("text/html"));
    }
}
