//! Caller-visible task handle.
//!
//! A [`Task`] is a cheap, cloneable view of one logical request. Scalar state
//! lives in atomics so any thread can read snapshots; lifecycle commands are
//! forwarded to the engine that owns the transfer.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::http::drain::DrainResult;
use crate::http::response::HttpResponse;
use crate::urlrequest::engine::Command;
use crate::urlrequest::request::Request;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

/// Identifier of a task, unique within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Running = 0,
    Suspended = 1,
    Canceling = 2,
    Completed = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Running,
            1 => TaskState::Suspended,
            2 => TaskState::Canceling,
            _ => TaskState::Completed,
        }
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct TaskInner {
    id: TaskId,
    state: AtomicU8,
    load_state: AtomicU8,
    description: Mutex<Option<String>>,
    original_request: Request,
    current_request: Mutex<Request>,
    response: Mutex<Option<HttpResponse>>,
    error: Mutex<Option<NetError>>,
    result: Mutex<Option<DrainResult>>,
    bytes_received: AtomicI64,
    bytes_expected_to_receive: AtomicI64,
    bytes_sent: AtomicI64,
    bytes_expected_to_send: AtomicI64,
    completed: Notify,
    commands: UnboundedSender<Command>,
}

/// One logical HTTP exchange, possibly spanning several transfers.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Tasks start suspended.
    pub(crate) fn new(id: TaskId, request: Request, commands: UnboundedSender<Command>) -> Self {
        let expected_send = request.body().len().map_or(-1, |n| n as i64);
        Self {
            inner: Arc::new(TaskInner {
                id,
                state: AtomicU8::new(TaskState::Suspended as u8),
                load_state: AtomicU8::new(LoadState::Idle as u8),
                description: Mutex::new(None),
                current_request: Mutex::new(request.clone()),
                original_request: request,
                response: Mutex::new(None),
                error: Mutex::new(None),
                result: Mutex::new(None),
                bytes_received: AtomicI64::new(0),
                bytes_expected_to_receive: AtomicI64::new(-1),
                bytes_sent: AtomicI64::new(0),
                bytes_expected_to_send: AtomicI64::new(expected_send),
                completed: Notify::new(),
                commands,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn load_state(&self) -> LoadState {
        LoadState::from_u8(self.inner.load_state.load(Ordering::Relaxed))
    }

    pub fn description(&self) -> Option<String> {
        lock(&self.inner.description).clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        *lock(&self.inner.description) = Some(description.into());
    }

    pub fn original_request(&self) -> &Request {
        &self.inner.original_request
    }

    /// The request of the current attempt. Differs from the original after
    /// a redirect.
    pub fn current_request(&self) -> Request {
        lock(&self.inner.current_request).clone()
    }

    pub fn response(&self) -> Option<HttpResponse> {
        lock(&self.inner.response).clone()
    }

    /// Terminal error, once the task has completed with one.
    pub fn error(&self) -> Option<NetError> {
        *lock(&self.inner.error)
    }

    pub fn bytes_received(&self) -> i64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// `-1` while unknown.
    pub fn bytes_expected_to_receive(&self) -> i64 {
        self.inner.bytes_expected_to_receive.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> i64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    /// `-1` while unknown.
    pub fn bytes_expected_to_send(&self) -> i64 {
        self.inner.bytes_expected_to_send.load(Ordering::Relaxed)
    }

    /// Start the task, or continue it after [`Task::suspend`].
    pub fn resume(&self) {
        if self.transition(TaskState::Suspended, TaskState::Running) {
            self.send(Command::Resume(self.id()));
        }
    }

    pub fn suspend(&self) {
        if self.transition(TaskState::Running, TaskState::Suspended) {
            self.send(Command::Suspend(self.id()));
        }
    }

    /// Mark the task as canceling. The `Cancelled` completion is delivered by
    /// the engine on its next iteration.
    pub fn cancel(&self) {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            let state = TaskState::from_u8(current);
            if matches!(state, TaskState::Canceling | TaskState::Completed) {
                return;
            }
            match self.inner.state.compare_exchange(
                current,
                TaskState::Canceling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.send(Command::Cancel(self.id()));
    }

    /// Wait until the task delivered its terminal event.
    pub async fn wait(&self) -> Result<(), NetError> {
        loop {
            let notified = self.inner.completed.notified();
            if self.state() == TaskState::Completed {
                return match self.error() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }
            notified.await;
        }
    }

    /// Body collected by a memory drain.
    pub fn body(&self) -> Option<Bytes> {
        match &*lock(&self.inner.result) {
            Some(DrainResult::Memory(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn text(&self) -> Result<String, NetError> {
        let body = self.body().unwrap_or_default();
        String::from_utf8(body.to_vec()).map_err(|_| NetError::InvalidUtf8)
    }

    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        let body = self.body().unwrap_or_default();
        serde_json::from_slice(&body).map_err(|_| NetError::JsonParseError)
    }

    /// Destination of a file drain, once the task completed.
    pub fn downloaded_file(&self) -> Option<PathBuf> {
        match &*lock(&self.inner.result) {
            Some(DrainResult::File { path, .. }) => Some(path.clone()),
            _ => None,
        }
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn send(&self, command: Command) {
        if self.inner.commands.send(command).is_err() {
            tracing::debug!(task = %self.id(), "engine is gone, command dropped");
        }
    }

    pub(crate) fn commands(&self) -> UnboundedSender<Command> {
        self.inner.commands.clone()
    }

    pub(crate) fn set_load_state(&self, state: LoadState) {
        self.inner.load_state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn set_current_request(&self, request: Request) {
        *lock(&self.inner.current_request) = request;
    }

    pub(crate) fn set_response(&self, response: Option<HttpResponse>) {
        *lock(&self.inner.response) = response;
    }

    /// A new attempt starts counting received bytes from zero.
    pub(crate) fn reset_received(&self) {
        self.inner.bytes_received.store(0, Ordering::Relaxed);
        self.inner
            .bytes_expected_to_receive
            .store(-1, Ordering::Relaxed);
    }

    pub(crate) fn reset_sent(&self, expected: Option<u64>) {
        self.inner.bytes_sent.store(0, Ordering::Relaxed);
        self.inner
            .bytes_expected_to_send
            .store(expected.map_or(-1, |n| n as i64), Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_received(&self, n: u64) {
        self.inner
            .bytes_received
            .fetch_add(n as i64, Ordering::Relaxed);
    }

    pub(crate) fn set_expected_to_receive(&self, expected: Option<u64>) {
        self.inner
            .bytes_expected_to_receive
            .store(expected.map_or(-1, |n| n as i64), Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_sent(&self, n: u64) -> i64 {
        self.inner.bytes_sent.fetch_add(n as i64, Ordering::Relaxed) + n as i64
    }

    /// Store the terminal outcome. The task is not `Completed` until
    /// [`Task::mark_completed`].
    pub(crate) fn set_outcome(&self, result: Option<DrainResult>, error: Option<NetError>) {
        *lock(&self.inner.result) = result;
        *lock(&self.inner.error) = error;
        self.set_load_state(LoadState::Idle);
    }

    pub(crate) fn mark_completed(&self) {
        self.inner
            .state
            .store(TaskState::Completed as u8, Ordering::Release);
        self.inner.completed.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn complete(&self, result: Option<DrainResult>, error: Option<NetError>) {
        self.set_outcome(result, error);
        self.mark_completed();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("url", &self.inner.original_request.url().as_str())
            .field("bytes_received", &self.bytes_received())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn task() -> (Task, tokio::sync::mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = unbounded_channel();
        let request = Request::parse("http://example.com/").unwrap();
        (Task::new(TaskId(1), request, tx), rx)
    }

    #[test]
    fn test_new_task_is_suspended() {
        let (task, _rx) = task();
        assert_eq!(task.state(), TaskState::Suspended);
        assert_eq!(task.bytes_expected_to_receive(), -1);
        assert_eq!(task.bytes_expected_to_send(), 0);
        assert_eq!(task.load_state(), LoadState::Idle);
    }

    #[test]
    fn test_resume_suspend_send_commands() {
        let (task, mut rx) = task();
        task.resume();
        task.resume();
        task.suspend();
        assert!(matches!(rx.try_recv(), Ok(Command::Resume(TaskId(1)))));
        assert!(matches!(rx.try_recv(), Ok(Command::Suspend(TaskId(1)))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_is_immediate_and_once() {
        let (task, mut rx) = task();
        task.cancel();
        assert_eq!(task.state(), TaskState::Canceling);
        task.cancel();
        task.resume();
        assert!(matches!(rx.try_recv(), Ok(Command::Cancel(TaskId(1)))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_error() {
        let (task, _rx) = task();
        let waiter = task.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        task.complete(None, Some(NetError::Cancelled));
        assert_eq!(handle.await.unwrap(), Err(NetError::Cancelled));
        // Already complete
        assert_eq!(task.wait().await, Err(NetError::Cancelled));
    }

    #[test]
    fn test_text_body() {
        let (task, _rx) = task();
        task.complete(Some(DrainResult::Memory(Bytes::from("hello"))), None);
        assert_eq!(task.text().unwrap(), "hello");
        assert!(task.downloaded_file().is_none());

        task.complete(Some(DrainResult::Memory(Bytes::from_static(&[0xff]))), None);
        assert_eq!(task.text().unwrap_err(), NetError::InvalidUtf8);
    }
}
