//! Response cache collaborator.
//!
//! Chromium mapping: net/http/http_cache.h (simplified in-memory version)
//!
//! The engine consults the cache before starting network work for GET and
//! HEAD requests and stores fully drained in-memory responses afterwards.

use crate::http::response::HttpResponse;
use crate::urlrequest::request::Request;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use url::Url;

/// How a request uses the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Fresh entries are served, everything else goes to the network.
    #[default]
    UseProtocolCachePolicy,
    /// Always load from the network.
    ReloadIgnoringCacheData,
    /// Serve any entry, stale or not; load on a miss.
    ReturnCacheDataElseLoad,
    /// Serve any entry; fail with `CacheMiss` instead of loading.
    ReturnCacheDataDontLoad,
}

impl CachePolicy {
    pub fn reads_cache(&self) -> bool {
        !matches!(self, CachePolicy::ReloadIgnoringCacheData)
    }

    pub fn accepts_stale(&self) -> bool {
        matches!(
            self,
            CachePolicy::ReturnCacheDataElseLoad | CachePolicy::ReturnCacheDataDontLoad
        )
    }
}

/// Cache key: URL without fragment plus method.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    url: String,
    method: Method,
}

impl CacheKey {
    pub fn new(url: &Url, method: &Method) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            url: url.into(),
            method: method.clone(),
        }
    }
}

/// Cached response entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: HttpResponse,
    pub body: Bytes,
    /// When this entry was cached
    pub cached_at: Instant,
    /// Time-to-live (from max-age)
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    /// Check if the entry is still fresh.
    pub fn is_fresh(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.cached_at.elapsed() < ttl,
            None => false,
        }
    }
}

pub trait ResponseCache: Send + Sync {
    fn lookup(&self, request: &Request) -> Option<CacheEntry>;

    fn store(&self, request: &Request, response: &HttpResponse, body: &Bytes);
}

/// In-memory cache built on `DashMap`.
pub struct MemoryResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
    max_entries: usize,
    current_size: AtomicUsize,
    max_size_bytes: usize,
}

impl Default for MemoryResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResponseCache {
    pub fn new() -> Self {
        Self::with_limits(1000, 50 * 1024 * 1024)
    }

    pub fn with_limits(max_entries: usize, max_size_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            current_size: AtomicUsize::new(0),
            max_size_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.current_size.store(0, Ordering::Relaxed);
    }

    fn maybe_evict(&self, new_entry_size: usize) {
        while self.entries.len() >= self.max_entries {
            if !self.evict_one() {
                break;
            }
        }
        while self.current_size.load(Ordering::Relaxed) + new_entry_size > self.max_size_bytes {
            if !self.evict_one() {
                break;
            }
        }
    }

    /// Evict the oldest entry.
    fn evict_one(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().cached_at)
            .map(|e| e.key().clone());
        match oldest {
            Some(key) => {
                self.remove_by_key(&key);
                true
            }
            None => false,
        }
    }

    fn remove_by_key(&self, key: &CacheKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.current_size
                .fetch_sub(entry.body.len(), Ordering::Relaxed);
        }
    }
}

impl ResponseCache for MemoryResponseCache {
    fn lookup(&self, request: &Request) -> Option<CacheEntry> {
        if !is_cacheable_method(request.method()) {
            return None;
        }
        let key = CacheKey::new(request.url(), request.method());
        let entry = self.entries.get(&key)?;
        if entry.is_fresh() || request.cache_policy().accepts_stale() {
            Some(entry.clone())
        } else {
            None
        }
    }

    fn store(&self, request: &Request, response: &HttpResponse, body: &Bytes) {
        if !is_cacheable_method(request.method()) || !response.status().is_success() {
            return;
        }
        let cache_control = parse_cache_control(response.headers());
        if cache_control.no_store || body.len() > self.max_size_bytes {
            return;
        }
        let ttl = if cache_control.no_cache {
            Some(Duration::ZERO)
        } else {
            cache_control.max_age.map(Duration::from_secs)
        };
        if ttl.is_none() {
            return;
        }

        let key = CacheKey::new(request.url(), request.method());
        self.remove_by_key(&key);
        self.maybe_evict(body.len());
        self.current_size.fetch_add(body.len(), Ordering::Relaxed);
        self.entries.insert(
            key,
            CacheEntry {
                response: response.clone(),
                body: body.clone(),
                cached_at: Instant::now(),
                ttl,
            },
        );
    }
}

impl std::fmt::Debug for MemoryResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryResponseCache")
            .field("entries", &self.entries.len())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

fn is_cacheable_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

/// Parsed Cache-Control directive.
#[derive(Debug, Default)]
struct CacheControl {
    no_store: bool,
    no_cache: bool,
    max_age: Option<u64>,
}

/// Parse Cache-Control header.
fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();
    let Some(value) = headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
    else {
        return cc;
    };

    for directive in value.split(',') {
        let directive = directive.trim().to_lowercase();
        if directive == "no-store" {
            cc.no_store = true;
        } else if directive == "no-cache" {
            cc.no_cache = true;
        } else if let Some(age) = directive.strip_prefix("max-age=") {
            cc.max_age = age.parse().ok();
        }
    }
    cc
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, StatusCode, Version};

    fn response(cache_control: Option<&'static str>) -> HttpResponse {
        let mut headers = HeaderMap::new();
        if let Some(cc) = cache_control {
            headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static(cc));
        }
        HttpResponse::new(
            Url::parse("http://example.com/a").unwrap(),
            StatusCode::OK,
            Version::HTTP_11,
            "OK".into(),
            headers,
        )
    }

    fn request() -> Request {
        Request::parse("http://example.com/a#frag").unwrap()
    }

    #[test]
    fn test_store_and_lookup_fresh() {
        let cache = MemoryResponseCache::new();
        cache.store(&request(), &response(Some("max-age=3600")), &Bytes::from("body"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_bytes(), 4);

        // Fragment is not part of the key
        let other = Request::parse("http://example.com/a").unwrap();
        let entry = cache.lookup(&other).unwrap();
        assert_eq!(entry.body, Bytes::from("body"));
        assert_eq!(entry.response.status(), StatusCode::OK);
    }

    #[test]
    fn test_no_store_and_uncacheable() {
        let cache = MemoryResponseCache::new();
        cache.store(&request(), &response(Some("no-store")), &Bytes::from("x"));
        cache.store(&request(), &response(None), &Bytes::from("x"));
        assert!(cache.is_empty());

        let post = request().with_method(Method::POST);
        cache.store(&post, &response(Some("max-age=60")), &Bytes::from("x"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_entry_policy() {
        let cache = MemoryResponseCache::new();
        cache.store(&request(), &response(Some("no-cache")), &Bytes::from("stale"));
        assert!(cache.lookup(&request()).is_none());

        let stale_ok = request().with_cache_policy(CachePolicy::ReturnCacheDataElseLoad);
        assert!(cache.lookup(&stale_ok).is_some());
    }

    #[test]
    fn test_eviction_by_count() {
        let cache = MemoryResponseCache::with_limits(2, 1024);
        for path in ["a", "b", "c"] {
            let req = Request::parse(&format!("http://example.com/{}", path)).unwrap();
            cache.store(&req, &response(Some("max-age=60")), &Bytes::from("x"));
        }
        assert_eq!(cache.len(), 2);
    }
}
