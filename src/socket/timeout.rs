//! One-shot, rearmable timer owned by the event loop.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

type Handler<T> = Box<dyn FnOnce() -> T + Send>;

/// Fires its handler once after the armed duration.
///
/// The timer only advances when the owning loop polls it, so `cancel`
/// takes effect immediately: a cancelled handler never runs.
pub struct TimeoutSource<T> {
    sleep: Option<Pin<Box<Sleep>>>,
    handler: Option<Handler<T>>,
}

impl<T> Default for TimeoutSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeoutSource<T> {
    pub fn new() -> Self {
        Self {
            sleep: None,
            handler: None,
        }
    }

    /// Arm the timer, replacing any pending invocation.
    pub fn arm(&mut self, after: Duration, handler: impl FnOnce() -> T + Send + 'static) {
        let deadline = Instant::now() + after;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
        self.handler = Some(Box::new(handler));
    }

    pub fn cancel(&mut self) {
        self.handler = None;
    }

    pub fn is_armed(&self) -> bool {
        self.handler.is_some()
    }

    /// Resolve with the handler's result once the deadline passes.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<T> {
        if self.handler.is_none() {
            return Poll::Pending;
        }
        let Some(sleep) = self.sleep.as_mut() else {
            return Poll::Pending;
        };
        if sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }
        match self.handler.take() {
            Some(handler) => Poll::Ready(handler()),
            None => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for TimeoutSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutSource")
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::poll_fn;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_duration() {
        let mut timer = TimeoutSource::new();
        let start = Instant::now();
        timer.arm(Duration::from_millis(100), || 7);
        assert!(timer.is_armed());

        let value = poll_fn(|cx| timer.poll_expired(cx)).await;
        assert_eq!(value, 7);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let mut timer = TimeoutSource::new();
        timer.arm(Duration::from_millis(10), || ());
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let fired = tokio::time::timeout(
            Duration::from_millis(100),
            poll_fn(|cx| timer.poll_expired(cx)),
        )
        .await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous() {
        let mut timer = TimeoutSource::new();
        let start = Instant::now();
        timer.arm(Duration::from_millis(500), || "first");
        timer.arm(Duration::from_millis(50), || "second");

        let value = poll_fn(|cx| timer.poll_expired(cx)).await;
        assert_eq!(value, "second");
        assert!(start.elapsed() < Duration::from_millis(500));

        // The replaced handler is gone for good
        let again = tokio::time::timeout(
            Duration::from_secs(1),
            poll_fn(|cx| timer.poll_expired(cx)),
        )
        .await;
        assert!(again.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_fire() {
        let mut timer = TimeoutSource::new();
        timer.arm(Duration::ZERO, || 1);
        assert_eq!(poll_fn(|cx| timer.poll_expired(cx)).await, 1);
        timer.arm(Duration::from_millis(5), || 2);
        assert_eq!(poll_fn(|cx| timer.poll_expired(cx)).await, 2);
    }
}
