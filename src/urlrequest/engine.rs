//! The event loop that owns every transfer of a session.
//!
//! One engine runs as a single tokio task. Commands from tasks, decision
//! objects and body streams arrive over an unbounded channel; socket and
//! timer triggers come from the [`Multiplexer`]. Everything that touches a
//! job runs here, serialized.

use crate::base::neterror::NetError;
use crate::http::bodysource::BodyChunk;
use crate::http::drain::DrainKind;
use crate::socket::multiplexer::Multiplexer;
use crate::socket::transport::{
    HandleAction, PauseState, TransferEvents, TransferId, Transport, Trigger,
};
use crate::urlrequest::cache::CachePolicy;
use crate::urlrequest::context::SessionConfig;
use crate::urlrequest::delegate::{RedirectDecision, ResponseDecision, TaskDelegate};
use crate::urlrequest::job::{CompletionAction, HttpJob, Lifecycle};
use crate::urlrequest::registry::TaskRegistry;
use crate::urlrequest::request::Request;
use crate::urlrequest::task::{Task, TaskId, TaskState};
use futures::future::poll_fn;
use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::UnboundedReceiver;

/// Iterations per poll before yielding back to the runtime.
const POLL_BUDGET: usize = 128;

const PAUSE_BOTH: PauseState = PauseState {
    receive: true,
    send: true,
};

pub(crate) enum Command {
    Add {
        task: Task,
        delegate: Option<Arc<dyn TaskDelegate>>,
        drain: DrainKind,
    },
    Resume(TaskId),
    Suspend(TaskId),
    Cancel(TaskId),
    RedirectDecided(TaskId, Option<Request>),
    ResponseDecided(TaskId, bool),
    /// A streamed upload body has bytes again.
    OutboundAvailable(TaskId),
    ResetMultiplexer,
    /// The session handle is gone; no new tasks can arrive.
    SessionClosed,
}

pub(crate) struct Engine<T: Transport> {
    config: Arc<SessionConfig>,
    mux: Multiplexer<T>,
    jobs: HashMap<TaskId, HttpJob>,
    transfers: HashMap<TransferId, TaskId>,
    commands: UnboundedReceiver<Command>,
    registry: Arc<TaskRegistry>,
    closing: bool,
}

impl<T: Transport> Engine<T> {
    pub(crate) fn new(
        config: Arc<SessionConfig>,
        transport: T,
        commands: UnboundedReceiver<Command>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            config,
            mux: Multiplexer::new(transport),
            jobs: HashMap::new(),
            transfers: HashMap::new(),
            commands,
            registry,
            closing: false,
        }
    }

    /// Run until every command sender is gone, or the session is closed and
    /// its last job finished.
    pub(crate) async fn run(mut self) {
        tracing::debug!("engine started");
        poll_fn(|cx| self.poll_run(cx)).await;
        tracing::debug!("engine stopped");
    }

    fn poll_run(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        for _ in 0..POLL_BUDGET {
            let mut progressed = false;
            loop {
                match self.commands.poll_recv(cx) {
                    Poll::Ready(Some(command)) => {
                        self.handle_command(command);
                        progressed = true;
                    }
                    Poll::Ready(None) => return Poll::Ready(()),
                    Poll::Pending => break,
                }
            }
            // An unarmed timer registers no waker, so keep going until a full
            // pass finds nothing to do.
            if let Poll::Ready(trigger) = self.mux.poll_event(cx) {
                self.pump(trigger);
                progressed = true;
            }
            if self.closing && self.jobs.is_empty() {
                return Poll::Ready(());
            }
            if !progressed {
                return Poll::Pending;
            }
        }
        cx.waker().wake_by_ref();
        Poll::Pending
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add {
                task,
                delegate,
                drain,
            } => {
                let id = task.id();
                tracing::trace!(task = %id, url = %task.original_request().url(), "task added");
                let job = HttpJob::new(task, delegate, drain, self.config.max_redirects);
                self.jobs.insert(id, job);
            }
            Command::Resume(id) => self.resume(id),
            Command::Suspend(id) => {
                if let Some(transfer) = self.jobs.get(&id).and_then(|j| j.transfer()) {
                    self.mux.set_pause(transfer, PAUSE_BOTH);
                }
            }
            Command::Cancel(id) => {
                if self.jobs.contains_key(&id) {
                    tracing::debug!(task = %id, "cancelling");
                    self.finish(id, Some(NetError::Cancelled));
                }
            }
            Command::RedirectDecided(id, request) => {
                let action = self
                    .jobs
                    .get_mut(&id)
                    .and_then(|j| j.resolve_redirect(request));
                if let Some(action) = action {
                    self.apply(id, action);
                }
            }
            Command::ResponseDecided(id, allow) => {
                let action = self
                    .jobs
                    .get_mut(&id)
                    .and_then(|j| j.resolve_response(allow));
                if let Some(action) = action {
                    self.apply(id, action);
                }
            }
            Command::OutboundAvailable(id) => {
                let Some(job) = self.jobs.get(&id) else {
                    return;
                };
                if job.task().state() == TaskState::Suspended {
                    return;
                }
                let Some(transfer) = job.transfer() else {
                    return;
                };
                if let Some(pause) = self.mux.handle(transfer).map(|h| h.pause_state()) {
                    if pause.send {
                        self.mux.set_pause(
                            transfer,
                            PauseState {
                                receive: pause.receive,
                                send: false,
                            },
                        );
                    }
                }
            }
            Command::ResetMultiplexer => {
                if let Some(error) = self.mux.failure() {
                    tracing::debug!(error = %error, "multiplexer reset");
                }
                self.mux.reset();
            }
            Command::SessionClosed => {
                self.closing = true;
                // Started tasks run to completion; unstarted ones never will
                let unstarted: Vec<TaskId> = self
                    .jobs
                    .iter()
                    .filter(|(_, job)| job.lifecycle() == Lifecycle::Initial)
                    .map(|(id, _)| *id)
                    .collect();
                if !unstarted.is_empty() {
                    tracing::debug!(tasks = unstarted.len(), "session closed, cancelling unstarted tasks");
                }
                for id in unstarted {
                    self.finish(id, Some(NetError::Cancelled));
                }
            }
        }
    }

    fn resume(&mut self, id: TaskId) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        if job.lifecycle() == Lifecycle::Initial {
            self.start(id);
        } else if let Some(transfer) = job.transfer() {
            self.mux.set_pause(transfer, PauseState::default());
        }
    }

    /// First start of a task: the cache may answer it.
    fn start(&mut self, id: TaskId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        let request = job.task().current_request();
        let policy = request.cache_policy();
        if policy.reads_cache() {
            let entry = self
                .config
                .cache
                .as_ref()
                .and_then(|cache| cache.lookup(&request));
            match entry {
                Some(entry) => {
                    tracing::debug!(task = %id, url = %request.url(), "served from cache");
                    let action = job.fulfill_from_cache(entry);
                    self.apply(id, action);
                    return;
                }
                None if policy == CachePolicy::ReturnCacheDataDontLoad => {
                    self.finish(id, Some(NetError::CacheMiss));
                    return;
                }
                None => {}
            }
        }
        self.begin_attempt(id);
    }

    fn begin_attempt(&mut self, id: TaskId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        let registered = job.prepare_attempt(&self.config).and_then(|handle| {
            let transfer = handle.id();
            self.mux.register(handle)?;
            job.attach(transfer);
            Ok(transfer)
        });
        match registered {
            Ok(transfer) => {
                self.transfers.insert(transfer, id);
                if job.task().state() == TaskState::Suspended {
                    self.mux.set_pause(transfer, PAUSE_BOTH);
                }
            }
            Err(error) => self.finish(id, Some(error)),
        }
    }

    fn apply(&mut self, id: TaskId, action: CompletionAction) {
        match action {
            CompletionAction::CompleteTask => self.finish(id, None),
            CompletionAction::FailWithError(error) => self.finish(id, Some(error)),
            CompletionAction::RedirectWithRequest(_) => self.begin_attempt(id),
            CompletionAction::ConsultRedirect { response, request } => {
                let Some(job) = self.jobs.get_mut(&id) else {
                    return;
                };
                match job.delegate().cloned() {
                    Some(delegate) => {
                        let decision =
                            RedirectDecision::new(id, request.clone(), job.task().commands());
                        delegate.will_perform_redirect(job.task(), &response, &request, decision);
                    }
                    None => {
                        if let Some(action) = job.resolve_redirect(Some(request)) {
                            self.apply(id, action);
                        }
                    }
                }
            }
            CompletionAction::ConsultResponse(response) => {
                let Some(job) = self.jobs.get_mut(&id) else {
                    return;
                };
                match job.delegate().cloned() {
                    Some(delegate) => {
                        let decision = ResponseDecision::new(id, job.task().commands());
                        delegate.did_receive_response(job.task(), &response, decision);
                    }
                    None => {
                        if let Some(action) = job.resolve_response(true) {
                            self.apply(id, action);
                        }
                    }
                }
            }
        }
    }

    /// Deliver the terminal event and forget the job.
    fn finish(&mut self, id: TaskId, error: Option<NetError>) {
        let Some(mut job) = self.jobs.remove(&id) else {
            return;
        };
        if let Some(transfer) = job.detach() {
            self.mux.unregister(transfer);
            self.transfers.remove(&transfer);
        }
        job.finish(error, self.config.cache.as_deref());
        self.registry.remove(id);
    }

    fn pump(&mut self, trigger: Trigger) {
        let mut completions = Vec::new();
        {
            let mut dispatch = Dispatch {
                jobs: &mut self.jobs,
                transfers: &self.transfers,
                completions: &mut completions,
            };
            self.mux.pump(trigger, &mut dispatch);
        }
        for (transfer, result) in completions {
            let Some(id) = self.transfers.remove(&transfer) else {
                continue;
            };
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.transfer() != Some(transfer) {
                continue;
            }
            let action = job.on_transfer_complete(result);
            self.apply(id, action);
        }
    }
}

/// Routes transport callbacks to jobs during a pump. Completions are only
/// recorded; they are acted on once the pump returns.
struct Dispatch<'a> {
    jobs: &'a mut HashMap<TaskId, HttpJob>,
    transfers: &'a HashMap<TransferId, TaskId>,
    completions: &'a mut Vec<(TransferId, Result<(), NetError>)>,
}

impl Dispatch<'_> {
    fn job(&mut self, id: TransferId) -> Option<&mut HttpJob> {
        let task = self.transfers.get(&id)?;
        self.jobs.get_mut(task)
    }
}

impl TransferEvents for Dispatch<'_> {
    fn on_header_data(
        &mut self,
        id: TransferId,
        line: &[u8],
        content_length: Option<u64>,
    ) -> HandleAction {
        self.job(id)
            .map_or(HandleAction::Abort, |j| j.on_header_line(line, content_length))
    }

    fn on_body_data(&mut self, id: TransferId, data: &[u8]) -> HandleAction {
        self.job(id)
            .map_or(HandleAction::Abort, |j| j.on_body_data(data))
    }

    fn on_need_outbound(&mut self, id: TransferId, max: usize) -> BodyChunk {
        self.job(id)
            .map_or(BodyChunk::Error(NetError::Cancelled), |j| {
                j.on_need_outbound(max)
            })
    }

    fn on_seek(&mut self, id: TransferId, position: u64) -> bool {
        self.job(id).is_some_and(|j| j.on_seek(position))
    }

    fn on_transfer_complete(&mut self, id: TransferId, result: Result<(), NetError>) {
        self.completions.push((id, result));
    }
}

impl<T: Transport> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("jobs", &self.jobs.len())
            .field("transfers", &self.transfers.len())
            .field("closing", &self.closing)
            .field("mux", &self.mux)
            .finish()
    }
}
