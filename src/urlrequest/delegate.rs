//! Caller callbacks and the decision objects that answer them.
//!
//! Every callback runs on the engine task. Decisions may be answered later
//! from anywhere; a decision dropped unanswered takes its default.

use crate::base::neterror::NetError;
use crate::http::response::HttpResponse;
use crate::urlrequest::engine::Command;
use crate::urlrequest::request::Request;
use crate::urlrequest::task::{Task, TaskId};
use tokio::sync::mpsc::UnboundedSender;

pub trait TaskDelegate: Send + Sync {
    /// A redirect response arrived. `decision` follows `new_request` unless
    /// told otherwise.
    fn will_perform_redirect(
        &self,
        _task: &Task,
        _response: &HttpResponse,
        _new_request: &Request,
        decision: RedirectDecision,
    ) {
        drop(decision);
    }

    /// The final response arrived, body included. `decision` allows it unless
    /// told otherwise.
    fn did_receive_response(
        &self,
        _task: &Task,
        _response: &HttpResponse,
        decision: ResponseDecision,
    ) {
        drop(decision);
    }

    fn did_receive_data(&self, _task: &Task, _data: &[u8]) {}

    fn did_send_body_data(
        &self,
        _task: &Task,
        _bytes_sent: u64,
        _total_bytes_sent: i64,
        _total_bytes_expected: i64,
    ) {
    }

    /// Exactly once per task.
    fn did_complete(&self, _task: &Task, _error: Option<NetError>) {}
}

/// Answer to [`TaskDelegate::will_perform_redirect`].
pub struct RedirectDecision {
    task: TaskId,
    proposed: Option<Request>,
    commands: Option<UnboundedSender<Command>>,
}

impl RedirectDecision {
    pub(crate) fn new(task: TaskId, proposed: Request, commands: UnboundedSender<Command>) -> Self {
        Self {
            task,
            proposed: Some(proposed),
            commands: Some(commands),
        }
    }

    pub fn proposed(&self) -> Option<&Request> {
        self.proposed.as_ref()
    }

    /// Follow with `request`, which may differ from the proposed one.
    pub fn follow(mut self, request: Request) {
        self.answer(Some(request));
    }

    /// Complete the task with the redirect response itself.
    pub fn decline(mut self) {
        self.answer(None);
    }

    fn answer(&mut self, request: Option<Request>) {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(Command::RedirectDecided(self.task, request));
        }
    }
}

impl Drop for RedirectDecision {
    fn drop(&mut self) {
        let proposed = self.proposed.take();
        self.answer(proposed);
    }
}

impl std::fmt::Debug for RedirectDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectDecision")
            .field("task", &self.task)
            .field("proposed", &self.proposed.as_ref().map(|r| r.url().as_str()))
            .finish()
    }
}

/// Answer to [`TaskDelegate::did_receive_response`].
pub struct ResponseDecision {
    task: TaskId,
    commands: Option<UnboundedSender<Command>>,
}

impl ResponseDecision {
    pub(crate) fn new(task: TaskId, commands: UnboundedSender<Command>) -> Self {
        Self {
            task,
            commands: Some(commands),
        }
    }

    pub fn allow(mut self) {
        self.answer(true);
    }

    /// Fail the task with `Cancelled`.
    pub fn cancel(mut self) {
        self.answer(false);
    }

    fn answer(&mut self, allow: bool) {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(Command::ResponseDecided(self.task, allow));
        }
    }
}

impl Drop for ResponseDecision {
    fn drop(&mut self) {
        self.answer(true);
    }
}

impl std::fmt::Debug for ResponseDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseDecision")
            .field("task", &self.task)
            .finish()
    }
}
