use crate::base::neterror::NetError;
use crate::http::requestbody::RequestBody;
use crate::urlrequest::cache::CachePolicy;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use std::time::Duration;
use url::Url;

/// Headers that never follow a redirect to another origin.
const CREDENTIAL_HEADERS: [HeaderName; 3] = [
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// A request as issued by the caller, or as synthesized for a redirect.
#[derive(Debug, Clone)]
pub struct Request {
    url: Url,
    method: Method,
    headers: HeaderMap,
    body: RequestBody,
    timeout: Option<Duration>,
    cache_policy: CachePolicy,
}

impl Request {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout: None,
            cache_policy: CachePolicy::default(),
        }
    }

    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|_| NetError::InvalidUrl)?;
        Ok(Self::new(url))
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Append a header. Invalid names or values fail with `InvalidHeader`.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, NetError> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| NetError::InvalidHeader)?;
        let value = HeaderValue::from_str(value).map_err(|_| NetError::InvalidHeader)?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Inactivity timeout for this request, overriding the session default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Serialize `value` as the body and set `Content-Type: application/json`.
    #[cfg(feature = "json")]
    pub fn with_json<T: serde::Serialize>(mut self, value: &T) -> Result<Self, NetError> {
        let body = serde_json::to_vec(value).map_err(|_| NetError::JsonParseError)?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = RequestBody::from(body);
        Ok(self)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Build the request that follows a redirect to `location`.
    ///
    /// 303 (except for HEAD) and 301/302 after a non-GET/HEAD method become
    /// a bodyless GET without `Content-*` headers; 307/308 keep method and
    /// body. Credentials are dropped when the origin changes.
    pub fn redirected_to(&self, location: &str, status: StatusCode) -> Result<Request, NetError> {
        let url = self
            .url
            .join(location.trim())
            .map_err(|_| NetError::InvalidRedirect)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NetError::UnsafeRedirect);
        }

        let mut next = self.clone();
        let keeps_method = self.method == Method::GET || self.method == Method::HEAD;
        let becomes_get = match status.as_u16() {
            303 => self.method != Method::HEAD,
            301 | 302 => !keeps_method,
            _ => false,
        };
        if becomes_get {
            next.method = Method::GET;
            next.body = RequestBody::Empty;
            let content: Vec<HeaderName> = next
                .headers
                .keys()
                .filter(|name| name.as_str().starts_with("content-"))
                .cloned()
                .collect();
            for name in content {
                next.headers.remove(&name);
            }
            next.headers.remove(header::TRANSFER_ENCODING);
        }

        if url.origin() != self.url.origin() {
            for name in CREDENTIAL_HEADERS.iter() {
                next.headers.remove(name);
            }
        }

        next.url = url;
        Ok(next)
    }
}
