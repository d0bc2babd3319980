//! Live-task bookkeeping for a session.

use crate::urlrequest::task::{Task, TaskId};
use dashmap::DashMap;
use std::sync::Mutex;
use tokio::sync::Notify;

type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Tracks every task that has not delivered its terminal event yet and
/// fires "all tasks finished" notifications when the set drains.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Task>,
    callbacks: Mutex<Vec<CompletionCallback>>,
    drained: Notify,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.tasks.insert(task.id(), task);
    }

    pub fn remove(&self, id: TaskId) -> Option<Task> {
        let (_, task) = self.tasks.remove(&id)?;
        if self.tasks.is_empty() {
            self.fire();
        }
        Some(task)
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(&id).map(|t| t.value().clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Live tasks ordered by id.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|e| e.value().clone()).collect();
        tasks.sort_by_key(|t| t.id());
        tasks
    }

    /// Run `callback` once no live task remains. Runs immediately if the
    /// registry is already empty.
    pub fn notify_on_tasks_completion(&self, callback: impl FnOnce() + Send + 'static) {
        if self.tasks.is_empty() {
            callback();
            return;
        }
        self.lock_callbacks().push(Box::new(callback));
        // The last task may have finished in between
        if self.tasks.is_empty() {
            self.fire();
        }
    }

    /// Wait until no live task remains.
    pub async fn wait_until_empty(&self) {
        loop {
            let notified = self.drained.notified();
            if self.tasks.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn fire(&self) {
        let callbacks = std::mem::take(&mut *self.lock_callbacks());
        tracing::trace!(callbacks = callbacks.len(), "all tasks finished");
        for callback in callbacks {
            callback();
        }
        self.drained.notify_waiters();
    }

    fn lock_callbacks(&self) -> std::sync::MutexGuard<'_, Vec<CompletionCallback>> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urlrequest::request::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;

    fn task(id: u64) -> Task {
        let (tx, _rx) = unbounded_channel();
        Task::new(TaskId(id), Request::parse("http://example.com/").unwrap(), tx)
    }

    #[test]
    fn test_callback_fires_when_last_task_leaves() {
        let registry = TaskRegistry::new();
        registry.insert(task(2));
        registry.insert(task(1));
        assert_eq!(
            registry.tasks().iter().map(|t| t.id()).collect::<Vec<_>>(),
            vec![TaskId(1), TaskId(2)]
        );

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        registry.notify_on_tasks_completion(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.remove(TaskId(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        registry.remove(TaskId(2));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Removing an unknown task does not fire again
        assert!(registry.remove(TaskId(2)).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_runs_immediately_when_empty() {
        let registry = TaskRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        registry.notify_on_tasks_completion(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_until_empty() {
        let registry = Arc::new(TaskRegistry::new());
        registry.insert(task(1));
        let waiter = registry.clone();
        let handle = tokio::spawn(async move { waiter.wait_until_empty().await });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        registry.remove(TaskId(1));
        handle.await.unwrap();
    }
}
