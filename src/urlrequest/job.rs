//! Per-task protocol state machine.
//!
//! Chromium mapping: net/url_request/url_request_http_job.cc
//!
//! An [`HttpJob`] owns the [`TransferState`] of the current attempt, folds
//! transport callbacks into it and decides what happens when an attempt
//! completes. It never touches the multiplexer; the engine acts on the
//! [`CompletionAction`]s it returns.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::http::bodysource::{BodyChunk, BodySource, RequestBodySource};
use crate::http::drain::{DrainKind, DrainResult};
use crate::http::response::HttpResponse;
use crate::http::transferstate::{FinishedTransfer, TransferState};
use crate::socket::handle::{BodyLength, TransferHandle};
use crate::socket::transport::{HandleAction, TransferId};
use crate::urlrequest::cache::{CacheEntry, ResponseCache};
use crate::urlrequest::context::SessionConfig;
use crate::urlrequest::delegate::TaskDelegate;
use crate::urlrequest::engine::Command;
use crate::urlrequest::request::Request;
use crate::urlrequest::task::{Task, TaskState};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Initial,
    TransferReady,
    TransferInProgress,
    WaitingForRedirectDecision,
    WaitingForResponseDecision,
    FulfillingFromCache,
    TransferCompleted,
    TransferFailed,
    TaskCompleted,
}

/// What the engine should do next for a job.
#[derive(Debug)]
pub enum CompletionAction {
    CompleteTask,
    FailWithError(NetError),
    RedirectWithRequest(Request),
    /// Ask the delegate whether to follow `request`.
    ConsultRedirect {
        response: HttpResponse,
        request: Request,
    },
    /// Ask the delegate whether to accept `response`.
    ConsultResponse(HttpResponse),
}

pub struct HttpJob {
    task: Task,
    delegate: Option<Arc<dyn TaskDelegate>>,
    drain_kind: DrainKind,
    lifecycle: Lifecycle,
    transfer: Option<TransferId>,
    state: Option<TransferState>,
    finished: Option<FinishedTransfer>,
    replay: Option<RequestBodySource>,
    pending_error: Option<NetError>,
    redirects: usize,
    max_redirects: usize,
    from_cache: bool,
}

impl HttpJob {
    pub fn new(
        task: Task,
        delegate: Option<Arc<dyn TaskDelegate>>,
        drain_kind: DrainKind,
        max_redirects: usize,
    ) -> Self {
        Self {
            task,
            delegate,
            drain_kind,
            lifecycle: Lifecycle::Initial,
            transfer: None,
            state: None,
            finished: None,
            replay: None,
            pending_error: None,
            redirects: 0,
            max_redirects,
            from_cache: false,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn delegate(&self) -> Option<&Arc<dyn TaskDelegate>> {
        self.delegate.as_ref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Transfer of the current attempt, while it is registered.
    pub fn transfer(&self) -> Option<TransferId> {
        self.transfer
    }

    pub fn redirect_count(&self) -> usize {
        self.redirects
    }

    /// Build the handle for a new attempt at the task's current request.
    ///
    /// Received counters restart at zero; the previous attempt, if any, has
    /// already been discarded.
    pub fn prepare_attempt(&mut self, config: &SessionConfig) -> Result<TransferHandle, NetError> {
        let request = self.task.current_request();
        let mut source = match self.replay.take() {
            Some(source) => Some(source),
            None if request.body().is_empty() => None,
            None => request.body().open_source()?,
        };
        if let Some(source) = source.as_mut() {
            let commands = self.task.commands();
            let id = self.task.id();
            source.set_data_available_handler(Arc::new(move || {
                let _ = commands.send(Command::OutboundAvailable(id));
            }));
        }

        let body_length = match &source {
            None => BodyLength::None,
            Some(s) => s.len().map_or(BodyLength::Chunked, BodyLength::Known),
        };
        let mut headers = config.additional_headers.clone();
        headers.extend(request.headers().clone());

        let mut handle = TransferHandle::new(request.url().clone());
        handle.set_method(request.method().clone());
        handle.set_headers(headers);
        handle.set_body_length(body_length);
        handle.set_proxy(
            config
                .proxy
                .clone()
                .filter(|p| !p.should_bypass(request.url())),
        );
        handle.set_follow_location(false);
        handle.set_timeout(
            request
                .timeout()
                .unwrap_or(config.timeout_interval_for_request),
        );
        handle.set_receive_buffer_size(config.receive_buffer_size);
        handle.set_verbose(config.verbose);
        handle.set_debug_output(config.debug_output);
        handle.set_tls_versions(config.tls_versions.clone());

        self.task.reset_received();
        self.task.reset_sent(match body_length {
            BodyLength::None => Some(0),
            BodyLength::Known(n) => Some(n),
            BodyLength::Chunked => None,
        });
        self.state = Some(TransferState::new(
            request.url().clone(),
            source,
            self.drain_kind.create(),
        ));
        self.finished = None;
        self.pending_error = None;
        self.lifecycle = Lifecycle::TransferReady;
        self.task.set_load_state(LoadState::Connecting);
        tracing::debug!(
            task = %self.task.id(),
            transfer = %handle.id(),
            method = %request.method(),
            url = %request.url(),
            "starting attempt"
        );
        Ok(handle)
    }

    /// Record the transfer registered for the prepared attempt.
    pub fn attach(&mut self, id: TransferId) {
        self.transfer = Some(id);
    }

    /// Forget the registered transfer, returning it for unregistration.
    pub fn detach(&mut self) -> Option<TransferId> {
        self.transfer.take()
    }

    fn enter_progress(&mut self) {
        if self.lifecycle == Lifecycle::TransferReady {
            self.lifecycle = Lifecycle::TransferInProgress;
        }
    }

    pub fn on_header_line(&mut self, line: &[u8], content_length: Option<u64>) -> HandleAction {
        self.enter_progress();
        let Some(state) = self.state.take() else {
            return HandleAction::Abort;
        };
        let was_complete = state.is_header_complete();
        match state.by_appending_header_line(line) {
            Ok(next) => {
                if !was_complete {
                    if let Some(response) = next.response() {
                        let expected = response.expected_content_length().or(content_length);
                        self.task.set_expected_to_receive(expected);
                        self.task.set_load_state(LoadState::ReadingResponse);
                        tracing::debug!(
                            task = %self.task.id(),
                            status = response.status().as_u16(),
                            "response headers complete"
                        );
                    } else {
                        self.task.set_load_state(LoadState::WaitingForResponse);
                    }
                }
                self.state = Some(next);
                HandleAction::Proceed
            }
            Err(error) => {
                tracing::debug!(task = %self.task.id(), error = %error, "bad response header");
                self.pending_error = Some(error);
                HandleAction::Abort
            }
        }
    }

    pub fn on_body_data(&mut self, data: &[u8]) -> HandleAction {
        if self.task.state() == TaskState::Suspended {
            return HandleAction::Pause;
        }
        self.enter_progress();
        let Some(state) = self.state.take() else {
            return HandleAction::Abort;
        };
        match state.by_appending_body_data(data) {
            Ok(next) => {
                self.state = Some(next);
                self.task.add_bytes_received(data.len() as u64);
                if let Some(delegate) = &self.delegate {
                    delegate.did_receive_data(&self.task, data);
                }
                HandleAction::Proceed
            }
            Err(error) => {
                self.pending_error = Some(error);
                HandleAction::Abort
            }
        }
    }

    pub fn on_need_outbound(&mut self, max: usize) -> BodyChunk {
        if self.task.state() == TaskState::Suspended {
            return BodyChunk::RetryLater;
        }
        self.enter_progress();
        let Some(source) = self.state.as_mut().and_then(|s| s.body_source_mut()) else {
            return BodyChunk::Done;
        };
        let chunk = source.next_chunk(max);
        match &chunk {
            BodyChunk::Data(data) => {
                self.task.set_load_state(LoadState::SendingRequest);
                let sent = data.len() as u64;
                let total = self.task.add_bytes_sent(sent);
                if let Some(delegate) = &self.delegate {
                    delegate.did_send_body_data(
                        &self.task,
                        sent,
                        total,
                        self.task.bytes_expected_to_send(),
                    );
                }
            }
            BodyChunk::Done => self.task.set_load_state(LoadState::WaitingForResponse),
            BodyChunk::RetryLater | BodyChunk::Error(_) => {}
        }
        chunk
    }

    pub fn on_seek(&mut self, position: u64) -> bool {
        self.state
            .as_mut()
            .and_then(|s| s.body_source_mut())
            .is_some_and(|s| s.seek_to(position))
    }

    /// Fold the in-flight snapshot into a finished one. Drained data is kept.
    fn settle_attempt(&mut self) -> Result<(), NetError> {
        if let Some(state) = self.state.take() {
            let finished = state.finish()?;
            if finished.response.is_some() {
                self.task.set_response(finished.response.clone());
            }
            self.finished = Some(finished);
        }
        Ok(())
    }

    fn fail(&mut self, error: NetError) -> CompletionAction {
        self.lifecycle = Lifecycle::TransferFailed;
        CompletionAction::FailWithError(error)
    }

    /// The transport finished the current attempt.
    pub fn on_transfer_complete(&mut self, result: Result<(), NetError>) -> CompletionAction {
        self.transfer = None;
        let error = self.pending_error.take().or(result.err());
        let settled = self.settle_attempt();
        if let Some(error) = error.or(settled.err()) {
            return self.fail(error);
        }
        self.lifecycle = Lifecycle::TransferCompleted;

        let Some(response) = self.finished.as_ref().and_then(|f| f.response.clone()) else {
            return self.fail(NetError::EmptyResponse);
        };
        let location = response.location().map(str::to_owned);
        match location {
            Some(location) if response.is_redirect() => {
                if self.redirects >= self.max_redirects {
                    return self.fail(NetError::TooManyRedirects);
                }
                let request = match self
                    .task
                    .current_request()
                    .redirected_to(&location, response.status())
                {
                    Ok(request) => request,
                    Err(error) => return self.fail(error),
                };
                self.lifecycle = Lifecycle::WaitingForRedirectDecision;
                self.task.set_load_state(LoadState::WaitingForDelegate);
                CompletionAction::ConsultRedirect { response, request }
            }
            _ => {
                self.lifecycle = Lifecycle::WaitingForResponseDecision;
                self.task.set_load_state(LoadState::WaitingForDelegate);
                CompletionAction::ConsultResponse(response)
            }
        }
    }

    /// Apply the caller's redirect decision. `None` accepts the redirect
    /// response as final. Returns `None` when no decision was pending.
    pub fn resolve_redirect(&mut self, request: Option<Request>) -> Option<CompletionAction> {
        if self.lifecycle != Lifecycle::WaitingForRedirectDecision {
            return None;
        }
        let Some(request) = request else {
            tracing::debug!(task = %self.task.id(), "redirect declined");
            return Some(CompletionAction::CompleteTask);
        };

        let previous = self.task.current_request();
        let prior_source = self.finished.take().and_then(|f| f.body_source);
        if !request.body().is_empty() && request.body().shares_source(previous.body()) {
            if let Some(mut source) = prior_source {
                if !source.is_rewindable() || !source.seek_to(0) {
                    return Some(self.fail(NetError::UploadStreamRewindNotSupported));
                }
                self.replay = Some(source);
            }
        }

        self.redirects += 1;
        tracing::debug!(
            task = %self.task.id(),
            url = %request.url(),
            redirects = self.redirects,
            "following redirect"
        );
        self.task.set_current_request(request.clone());
        self.lifecycle = Lifecycle::TransferReady;
        Some(CompletionAction::RedirectWithRequest(request))
    }

    /// Apply the caller's response decision. Returns `None` when no
    /// decision was pending.
    pub fn resolve_response(&mut self, allow: bool) -> Option<CompletionAction> {
        if self.lifecycle != Lifecycle::WaitingForResponseDecision {
            return None;
        }
        if allow {
            Some(CompletionAction::CompleteTask)
        } else {
            Some(self.fail(NetError::Cancelled))
        }
    }

    /// Serve the task from a cached response without touching the network.
    pub fn fulfill_from_cache(&mut self, entry: CacheEntry) -> CompletionAction {
        self.lifecycle = Lifecycle::FulfillingFromCache;
        self.from_cache = true;
        let mut drain = self.drain_kind.create();
        if let Err(error) = drain.append(&entry.body) {
            return self.fail(error);
        }
        let len = entry.body.len() as u64;
        self.task.set_expected_to_receive(Some(len));
        self.task.add_bytes_received(len);
        if let Some(delegate) = &self.delegate {
            if !entry.body.is_empty() {
                delegate.did_receive_data(&self.task, &entry.body);
            }
        }
        match drain.finish() {
            Ok(body) => {
                self.task.set_response(Some(entry.response.clone()));
                self.finished = Some(FinishedTransfer {
                    response: Some(entry.response),
                    body,
                    body_source: None,
                });
                CompletionAction::CompleteTask
            }
            Err(error) => self.fail(error),
        }
    }

    /// Deliver the terminal event. Called once; later calls do nothing.
    pub fn finish(&mut self, error: Option<NetError>, cache: Option<&dyn ResponseCache>) {
        if self.task.state() == TaskState::Completed {
            return;
        }
        self.transfer = None;
        if let Err(e) = self.settle_attempt() {
            tracing::warn!(task = %self.task.id(), error = %e, "failed to finish drain");
        }
        let (response, result) = match self.finished.take() {
            Some(f) => (f.response, Some(f.body)),
            None => (None, None),
        };
        let (result, error) = match (result, error) {
            (Some(result), None) => match result.complete() {
                Ok(result) => (Some(result), None),
                Err(e) => (None, Some(e)),
            },
            // A failed download that never wrote leaves no file behind
            (Some(result), Some(e)) if result.is_unwritten_file() => (None, Some(e)),
            other => other,
        };
        self.lifecycle = if error.is_some() {
            Lifecycle::TransferFailed
        } else {
            Lifecycle::TaskCompleted
        };
        if error.is_none() && !self.from_cache {
            if let (Some(cache), Some(response), Some(DrainResult::Memory(body))) =
                (cache, response.as_ref(), result.as_ref())
            {
                let current = self.task.current_request();
                cache.store(&current, response, body);
                // Lookups happen before any redirect, keyed by the first request
                let original = self.task.original_request();
                if original.url() != current.url() {
                    cache.store(original, response, body);
                }
            }
        }

        match &error {
            Some(e) => tracing::debug!(task = %self.task.id(), error = %e, "task failed"),
            None => tracing::debug!(task = %self.task.id(), "task completed"),
        }
        self.task.set_outcome(result, error);
        if let Some(delegate) = &self.delegate {
            delegate.did_complete(&self.task, error);
        }
        self.task.mark_completed();
    }
}

impl std::fmt::Debug for HttpJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJob")
            .field("task", &self.task.id())
            .field("lifecycle", &self.lifecycle)
            .field("transfer", &self.transfer)
            .field("redirects", &self.redirects)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urlrequest::task::TaskId;
    use bytes::Bytes;
    use http::{Method, StatusCode};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn job(request: Request, max_redirects: usize) -> (HttpJob, UnboundedReceiver<Command>) {
        let (tx, rx) = unbounded_channel();
        let task = Task::new(TaskId(1), request, tx);
        task.resume();
        (HttpJob::new(task, None, DrainKind::Memory, max_redirects), rx)
    }

    fn feed(job: &mut HttpJob, lines: &[&str]) {
        for line in lines {
            let line = format!("{}\r\n", line);
            assert_eq!(job.on_header_line(line.as_bytes(), None), HandleAction::Proceed);
        }
    }

    #[test]
    fn test_successful_attempt() {
        let (mut job, _rx) = job(Request::parse("http://example.com/").unwrap(), 20);
        let handle = job.prepare_attempt(&SessionConfig::default()).unwrap();
        assert!(handle.config().headers.contains_key("user-agent"));
        job.attach(handle.id());
        assert_eq!(job.lifecycle(), Lifecycle::TransferReady);

        feed(&mut job, &["HTTP/1.1 200 OK", "Content-Length: 6", ""]);
        assert_eq!(job.lifecycle(), Lifecycle::TransferInProgress);
        assert_eq!(job.task().bytes_expected_to_receive(), 6);
        assert_eq!(job.on_body_data(b"abc"), HandleAction::Proceed);
        assert_eq!(job.on_body_data(b"def"), HandleAction::Proceed);

        let action = job.on_transfer_complete(Ok(()));
        assert!(matches!(action, CompletionAction::ConsultResponse(ref r) if r.status() == StatusCode::OK));
        assert_eq!(job.lifecycle(), Lifecycle::WaitingForResponseDecision);
        assert!(matches!(
            job.resolve_response(true),
            Some(CompletionAction::CompleteTask)
        ));

        job.finish(None, None);
        assert_eq!(job.lifecycle(), Lifecycle::TaskCompleted);
        assert_eq!(job.task().state(), TaskState::Completed);
        assert_eq!(job.task().body(), Some(Bytes::from("abcdef")));
        assert_eq!(job.task().bytes_received(), 6);
    }

    #[test]
    fn test_malformed_status_line_fails() {
        let (mut job, _rx) = job(Request::parse("http://example.com/").unwrap(), 20);
        job.prepare_attempt(&SessionConfig::default()).unwrap();
        assert_eq!(
            job.on_header_line(b"HTTX/1.1 200 OK\r\n", None),
            HandleAction::Abort
        );
        let action = job.on_transfer_complete(Err(NetError::ConnectionAborted));
        assert!(matches!(
            action,
            CompletionAction::FailWithError(NetError::InvalidHttpResponse)
        ));
        assert_eq!(job.lifecycle(), Lifecycle::TransferFailed);
    }

    #[test]
    fn test_redirect_consulted_then_followed() {
        let (mut job, _rx) = job(Request::parse("http://example.com/a").unwrap(), 20);
        job.prepare_attempt(&SessionConfig::default()).unwrap();
        feed(
            &mut job,
            &["HTTP/1.1 302 Found", "Location: /b", "Content-Length: 0", ""],
        );
        let request = match job.on_transfer_complete(Ok(())) {
            CompletionAction::ConsultRedirect { request, response } => {
                assert_eq!(response.status(), StatusCode::FOUND);
                request
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(request.url().path(), "/b");

        let action = job.resolve_redirect(Some(request)).unwrap();
        assert!(matches!(action, CompletionAction::RedirectWithRequest(_)));
        assert_eq!(job.redirect_count(), 1);
        assert_eq!(job.task().current_request().url().path(), "/b");
        // A second answer is ignored
        assert!(job.resolve_redirect(None).is_none());
    }

    #[test]
    fn test_declined_redirect_completes_with_redirect_response() {
        let (mut job, _rx) = job(Request::parse("http://example.com/a").unwrap(), 20);
        job.prepare_attempt(&SessionConfig::default()).unwrap();
        feed(
            &mut job,
            &["HTTP/1.1 301 Moved", "Location: /b", "Content-Length: 4", ""],
        );
        job.on_body_data(b"gone");
        job.on_transfer_complete(Ok(()));
        assert!(matches!(
            job.resolve_redirect(None),
            Some(CompletionAction::CompleteTask)
        ));
        job.finish(None, None);
        let response = job.task().response().unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(job.task().body(), Some(Bytes::from("gone")));
    }

    #[test]
    fn test_redirect_limit() {
        let (mut job, _rx) = job(Request::parse("http://example.com/a").unwrap(), 0);
        job.prepare_attempt(&SessionConfig::default()).unwrap();
        feed(&mut job, &["HTTP/1.1 302 Found", "Location: /b", ""]);
        assert!(matches!(
            job.on_transfer_complete(Ok(())),
            CompletionAction::FailWithError(NetError::TooManyRedirects)
        ));
    }

    #[test]
    fn test_redirect_without_location_is_final() {
        let (mut job, _rx) = job(Request::parse("http://example.com/a").unwrap(), 20);
        job.prepare_attempt(&SessionConfig::default()).unwrap();
        feed(&mut job, &["HTTP/1.1 302 Found", "Content-Length: 0", ""]);
        assert!(matches!(
            job.on_transfer_complete(Ok(())),
            CompletionAction::ConsultResponse(_)
        ));
    }

    #[test]
    fn test_stream_body_cannot_replay() {
        let (_sender, body) = crate::http::requestbody::RequestBody::stream();
        let request = Request::parse("http://example.com/up")
            .unwrap()
            .with_method(Method::POST)
            .with_body(body);
        let (mut job, _rx) = job(request, 20);
        let handle = job.prepare_attempt(&SessionConfig::default()).unwrap();
        assert_eq!(handle.config().body_length, BodyLength::Chunked);
        feed(&mut job, &["HTTP/1.1 307 Temporary", "Location: /again", ""]);
        let request = match job.on_transfer_complete(Ok(())) {
            CompletionAction::ConsultRedirect { request, .. } => request,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(
            job.resolve_redirect(Some(request)),
            Some(CompletionAction::FailWithError(
                NetError::UploadStreamRewindNotSupported
            ))
        ));
    }

    #[test]
    fn test_memory_body_replays_after_307() {
        let request = Request::parse("http://example.com/up")
            .unwrap()
            .with_method(Method::PUT)
            .with_body("payload");
        let (mut job, _rx) = job(request, 20);
        job.prepare_attempt(&SessionConfig::default()).unwrap();
        assert_eq!(job.on_need_outbound(64), BodyChunk::Data(Bytes::from("payload")));
        assert_eq!(job.task().bytes_sent(), 7);
        feed(&mut job, &["HTTP/1.1 307 Temporary", "Location: /again", ""]);
        let request = match job.on_transfer_complete(Ok(())) {
            CompletionAction::ConsultRedirect { request, .. } => request,
            other => panic!("unexpected {:?}", other),
        };
        job.resolve_redirect(Some(request)).unwrap();
        let handle = job.prepare_attempt(&SessionConfig::default()).unwrap();
        assert_eq!(handle.config().method, Method::PUT);
        assert_eq!(handle.config().body_length, BodyLength::Known(7));
        assert_eq!(job.task().bytes_sent(), 0);
        assert_eq!(job.on_need_outbound(64), BodyChunk::Data(Bytes::from("payload")));
    }

    #[test]
    fn test_suspended_task_pauses_body() {
        let (mut job, _rx) = job(Request::parse("http://example.com/").unwrap(), 20);
        job.prepare_attempt(&SessionConfig::default()).unwrap();
        feed(&mut job, &["HTTP/1.1 200 OK", "Content-Length: 3", ""]);
        job.task().suspend();
        assert_eq!(job.on_body_data(b"abc"), HandleAction::Pause);
        assert_eq!(job.task().bytes_received(), 0);
        job.task().resume();
        assert_eq!(job.on_body_data(b"abc"), HandleAction::Proceed);
        assert_eq!(job.task().bytes_received(), 3);
    }

    #[test]
    fn test_declined_response_is_cancelled() {
        let (mut job, _rx) = job(Request::parse("http://example.com/").unwrap(), 20);
        job.prepare_attempt(&SessionConfig::default()).unwrap();
        feed(&mut job, &["HTTP/1.1 200 OK", "Content-Length: 0", ""]);
        job.on_transfer_complete(Ok(()));
        assert!(matches!(
            job.resolve_response(false),
            Some(CompletionAction::FailWithError(NetError::Cancelled))
        ));
        job.finish(Some(NetError::Cancelled), None);
        assert_eq!(job.task().error(), Some(NetError::Cancelled));
        // The response itself is still visible
        assert_eq!(job.task().response().unwrap().status(), StatusCode::OK);
    }
}
