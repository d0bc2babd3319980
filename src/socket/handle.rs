//! Per-transfer binding to the transport.

use crate::socket::proxy::ProxySettings;
use crate::socket::transport::{PauseState, TransferId};
use http::{HeaderMap, Method};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// How the outbound body is announced on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyLength {
    #[default]
    None,
    Known(u64),
    /// Length unknown up front; sent with chunked transfer coding.
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls1_2,
    Tls1_3,
}

/// Settings consumed by the transport when the transfer is added.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body_length: BodyLength,
    pub proxy: Option<ProxySettings>,
    /// Always `false`: redirects are handled by the task, not the transport.
    pub follow_location: bool,
    /// Inactivity timeout. Zero disables it.
    pub timeout: Duration,
    pub receive_buffer_size: usize,
    pub verbose: bool,
    pub debug_output: bool,
    pub tls_versions: Vec<TlsVersion>,
}

impl TransferConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body_length: BodyLength::None,
            proxy: None,
            follow_location: false,
            timeout: Duration::ZERO,
            receive_buffer_size: 64 * 1024,
            verbose: false,
            debug_output: false,
            tls_versions: vec![TlsVersion::Tls1_2, TlsVersion::Tls1_3],
        }
    }
}

/// One transfer attempt.
///
/// Configured through setters, then moved into the multiplexer by
/// `register`. Once its completion has been delivered it is dropped; a new
/// attempt gets a new handle.
#[derive(Debug)]
pub struct TransferHandle {
    id: TransferId,
    config: TransferConfig,
    pause: PauseState,
    deadline: Option<Instant>,
}

impl TransferHandle {
    pub fn new(url: Url) -> Self {
        Self {
            id: TransferId::next(),
            config: TransferConfig::new(url),
            pause: PauseState::default(),
            deadline: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn set_method(&mut self, method: Method) {
        self.config.method = method;
    }

    pub fn set_headers(&mut self, headers: HeaderMap) {
        self.config.headers = headers;
    }

    pub fn set_body_length(&mut self, length: BodyLength) {
        self.config.body_length = length;
    }

    pub fn set_proxy(&mut self, proxy: Option<ProxySettings>) {
        self.config.proxy = proxy;
    }

    pub fn set_follow_location(&mut self, follow: bool) {
        self.config.follow_location = follow;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn set_receive_buffer_size(&mut self, size: usize) {
        self.config.receive_buffer_size = size.max(1);
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.config.verbose = verbose;
    }

    pub fn set_debug_output(&mut self, debug_output: bool) {
        self.config.debug_output = debug_output;
    }

    pub fn set_tls_versions(&mut self, versions: Vec<TlsVersion>) {
        self.config.tls_versions = versions;
    }

    pub fn pause_state(&self) -> PauseState {
        self.pause
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Restart the inactivity countdown, unless a direction is paused.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.deadline = if self.config.timeout.is_zero() || self.pause.any() {
            None
        } else {
            Some(now + self.config.timeout)
        };
    }

    pub(crate) fn set_pause(&mut self, pause: PauseState, now: Instant) {
        self.pause = pause;
        self.touch(now);
    }
}
