//! Session - central configuration and task factory.
//!
//! Based on Chromium's net::URLRequestContext: one [`Session`] owns one
//! engine, and every task it creates runs on that engine.

use crate::base::neterror::NetError;
use crate::http::drain::DrainKind;
use crate::http::requestbody::RequestBody;
use crate::socket::handle::TlsVersion;
use crate::socket::proxy::ProxySettings;
use crate::socket::tcp::TcpTransport;
use crate::socket::transport::Transport;
use crate::urlrequest::cache::ResponseCache;
use crate::urlrequest::delegate::TaskDelegate;
use crate::urlrequest::engine::{Command, Engine};
use crate::urlrequest::registry::TaskRegistry;
use crate::urlrequest::request::Request;
use crate::urlrequest::task::{Task, TaskId};
use http::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

const DEFAULT_USER_AGENT: &str = concat!("muxnet/", env!("CARGO_PKG_VERSION"));

/// Configuration options for a [`Session`].
#[derive(Clone)]
pub struct SessionConfig {
    /// Inactivity timeout per transfer. Zero disables it.
    pub timeout_interval_for_request: Duration,

    /// Redirects followed before failing with `TooManyRedirects`.
    pub max_redirects: usize,

    /// Proxy settings (None for direct connections).
    pub proxy: Option<ProxySettings>,

    /// Connections per `host:port` for the built-in transport.
    pub http_max_connections_per_host: usize,

    pub receive_buffer_size: usize,

    /// Sent with every request unless the request sets the same header.
    pub additional_headers: HeaderMap,

    /// Log request and response header lines at debug level.
    pub verbose: bool,

    /// Log per-read and per-write byte counts at trace level.
    pub debug_output: bool,

    pub tls_versions: Vec<TlsVersion>,

    /// Response cache consulted for GET and HEAD requests.
    pub cache: Option<Arc<dyn ResponseCache>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut additional_headers = HeaderMap::new();
        additional_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        Self {
            timeout_interval_for_request: Duration::from_secs(60),
            max_redirects: 20,
            proxy: None,
            http_max_connections_per_host: 6,
            receive_buffer_size: 64 * 1024,
            additional_headers,
            verbose: false,
            debug_output: false,
            tls_versions: vec![TlsVersion::Tls1_2, TlsVersion::Tls1_3],
            cache: None,
        }
    }
}

impl SessionConfig {
    /// Defaults plus proxy settings from `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`
    /// and `MUXNET_VERBOSE`.
    pub fn from_env() -> Self {
        let verbose = std::env::var("MUXNET_VERBOSE")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            proxy: ProxySettings::from_env(),
            verbose,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_interval_for_request = timeout;
        self
    }

    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_max_connections_per_host(mut self, max: usize) -> Self {
        self.http_max_connections_per_host = max.max(1);
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size.max(1);
        self
    }

    pub fn with_additional_headers(mut self, headers: HeaderMap) -> Self {
        self.additional_headers.extend(headers);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_debug_output(mut self, debug_output: bool) -> Self {
        self.debug_output = debug_output;
        self
    }

    pub fn with_tls_versions(mut self, versions: Vec<TlsVersion>) -> Self {
        self.tls_versions = versions;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field(
                "timeout_interval_for_request",
                &self.timeout_interval_for_request,
            )
            .field("max_redirects", &self.max_redirects)
            .field("proxy", &self.proxy.as_ref().map(|p| p.url.as_str()))
            .field(
                "http_max_connections_per_host",
                &self.http_max_connections_per_host,
            )
            .field("receive_buffer_size", &self.receive_buffer_size)
            .field("additional_headers", &self.additional_headers.len())
            .field("verbose", &self.verbose)
            .field("debug_output", &self.debug_output)
            .field("tls_versions", &self.tls_versions)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

/// Creates tasks and runs them on its own engine.
///
/// Must be created inside a tokio runtime; the engine is spawned onto it.
pub struct Session {
    config: Arc<SessionConfig>,
    delegate: Option<Arc<dyn TaskDelegate>>,
    commands: UnboundedSender<Command>,
    registry: Arc<TaskRegistry>,
    next_task: AtomicU64,
    invalidated: AtomicBool,
}

impl Session {
    /// Session over the built-in HTTP/1.1 transport.
    pub fn new(config: SessionConfig) -> Self {
        let transport =
            TcpTransport::new().with_max_connections_per_host(config.http_max_connections_per_host);
        Self::with_transport(config, transport, None)
    }

    pub fn with_delegate(config: SessionConfig, delegate: Arc<dyn TaskDelegate>) -> Self {
        let transport =
            TcpTransport::new().with_max_connections_per_host(config.http_max_connections_per_host);
        Self::with_transport(config, transport, Some(delegate))
    }

    /// Session over a caller-supplied transport.
    pub fn with_transport<T: Transport>(
        config: SessionConfig,
        transport: T,
        delegate: Option<Arc<dyn TaskDelegate>>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(TaskRegistry::new());
        let (commands, receiver) = unbounded_channel();
        let engine = Engine::new(config.clone(), transport, receiver, registry.clone());
        tokio::spawn(engine.run());
        Self {
            config,
            delegate,
            commands,
            registry,
            next_task: AtomicU64::new(1),
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Task whose body is collected in memory.
    pub fn data_task(&self, request: Request) -> Result<Task, NetError> {
        self.task_with_drain(request, DrainKind::Memory, None)
    }

    pub fn data_task_with_url(&self, url: &str) -> Result<Task, NetError> {
        self.data_task(Request::parse(url)?)
    }

    /// Task sending `body`, replacing any body already set on `request`.
    pub fn upload_task(
        &self,
        request: Request,
        body: impl Into<RequestBody>,
    ) -> Result<Task, NetError> {
        self.data_task(request.with_body(body))
    }

    /// Task whose body is written to `destination`.
    pub fn download_task(
        &self,
        request: Request,
        destination: impl Into<PathBuf>,
    ) -> Result<Task, NetError> {
        self.task_with_drain(request, DrainKind::File(destination.into()), None)
    }

    /// Task with an explicit drain. `delegate` overrides the session's.
    pub fn task_with_drain(
        &self,
        request: Request,
        drain: DrainKind,
        delegate: Option<Arc<dyn TaskDelegate>>,
    ) -> Result<Task, NetError> {
        if self.invalidated.load(Ordering::Acquire) {
            return Err(NetError::ContextShutDown);
        }
        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        let task = Task::new(id, request, self.commands.clone());
        self.registry.insert(task.clone());
        let command = Command::Add {
            task: task.clone(),
            delegate: delegate.or_else(|| self.delegate.clone()),
            drain,
        };
        if self.commands.send(command).is_err() {
            self.registry.remove(id);
            return Err(NetError::ContextShutDown);
        }
        tracing::trace!(task = %id, url = %task.original_request().url(), "task created");
        Ok(task)
    }

    /// Tasks that have not completed yet.
    pub fn all_tasks(&self) -> Vec<Task> {
        self.registry.tasks()
    }

    /// Refuse new tasks; running ones finish normally.
    pub fn finish_tasks_and_invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    /// Refuse new tasks and cancel every live one.
    pub fn invalidate_and_cancel(&self) {
        self.invalidated.store(true, Ordering::Release);
        for task in self.registry.tasks() {
            task.cancel();
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Run `callback` once every live task has completed.
    pub fn notify_on_tasks_completion(&self, callback: impl FnOnce() + Send + 'static) {
        self.registry.notify_on_tasks_completion(callback);
    }

    /// Wait until every live task has completed.
    pub async fn wait_for_tasks(&self) {
        self.registry.wait_until_empty().await;
    }

    /// Accept new transfers again after the transport failed fatally.
    pub fn reset_multiplexer(&self) {
        let _ = self.commands.send(Command::ResetMultiplexer);
    }
}

/// Dropping the session cancels tasks that were never resumed. Started
/// tasks keep running until they complete.
impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::SessionClosed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("tasks", &self.registry.len())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}
