//! Shared readiness loop over every registered transfer.
//!
//! The multiplexer owns the transport, one read and/or write watcher per
//! socket the transport asked to have watched, and a single deadline timer.
//! [`Multiplexer::poll_event`] waits for the next trigger and
//! [`Multiplexer::pump`] runs one pass of transport work for it.

use crate::base::neterror::NetError;
use crate::http::bodysource::BodyChunk;
use crate::socket::handle::TransferHandle;
use crate::socket::timeout::TimeoutSource;
use crate::socket::transport::{
    HandleAction, PauseState, Readiness, SocketId, SocketInterest, SocketUpdate, TransferEvents,
    TransferId, Transport, Trigger,
};
use std::collections::HashMap;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

/// Live watchers of one socket, one per direction.
#[derive(Debug, Default)]
struct SocketSources {
    read: bool,
    write: bool,
}

pub struct Multiplexer<T: Transport> {
    transport: T,
    handles: HashMap<TransferId, TransferHandle>,
    sources: HashMap<SocketId, SocketSources>,
    timer: TimeoutSource<Trigger>,
    kick_pending: bool,
    failed: Option<NetError>,
}

impl<T: Transport> Multiplexer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            handles: HashMap::new(),
            sources: HashMap::new(),
            timer: TimeoutSource::new(),
            kick_pending: false,
            failed: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn is_registered(&self, id: TransferId) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn handle(&self, id: TransferId) -> Option<&TransferHandle> {
        self.handles.get(&id)
    }

    /// Fatal error that stopped the multiplexer, if any.
    pub fn failure(&self) -> Option<NetError> {
        self.failed
    }

    /// Number of live (read, write) watchers.
    pub fn watcher_count(&self) -> (usize, usize) {
        self.sources.values().fold((0, 0), |(r, w), s| {
            (r + s.read as usize, w + s.write as usize)
        })
    }

    pub fn register(&mut self, mut handle: TransferHandle) -> Result<(), NetError> {
        if self.failed.is_some() {
            return Err(NetError::MultiplexerFailed);
        }
        let id = handle.id();
        self.transport.add(id, handle.config())?;
        handle.touch(Instant::now());
        tracing::trace!(transfer = %id, url = %handle.config().url, "transfer registered");
        self.handles.insert(id, handle);
        self.kick();
        Ok(())
    }

    /// Remove a transfer. Its completion is not reported. Idempotent.
    pub fn unregister(&mut self, id: TransferId) -> Option<TransferHandle> {
        let handle = self.handles.remove(&id)?;
        let updates = self.transport.remove(id);
        self.apply_updates(updates);
        tracing::trace!(transfer = %id, "transfer unregistered");
        self.rearm();
        Some(handle)
    }

    pub fn set_pause(&mut self, id: TransferId, pause: PauseState) {
        let Some(handle) = self.handles.get_mut(&id) else {
            return;
        };
        let previous = handle.pause_state();
        handle.set_pause(pause, Instant::now());
        let updates = self.transport.set_pause(id, pause);
        self.apply_updates(updates);
        if (previous.receive && !pause.receive) || (previous.send && !pause.send) {
            self.kick();
        } else {
            self.rearm();
        }
    }

    /// Accept registrations again after a fatal failure.
    pub fn reset(&mut self) {
        self.failed = None;
    }

    /// Wait for the timer or a watched socket.
    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Trigger> {
        if let Poll::Ready(trigger) = self.timer.poll_expired(cx) {
            return Poll::Ready(trigger);
        }
        for (socket, sources) in &self.sources {
            if sources.read
                && self
                    .transport
                    .poll_socket(*socket, Readiness::Readable, cx)
                    .is_ready()
            {
                return Poll::Ready(Trigger::Socket(*socket, Readiness::Readable));
            }
            if sources.write
                && self
                    .transport
                    .poll_socket(*socket, Readiness::Writable, cx)
                    .is_ready()
            {
                return Poll::Ready(Trigger::Socket(*socket, Readiness::Writable));
            }
        }
        Poll::Pending
    }

    /// One pass of transport work, then recompute the shared deadline.
    pub fn pump(&mut self, trigger: Trigger, events: &mut dyn TransferEvents) {
        if trigger == Trigger::Timeout {
            self.kick_pending = false;
        }
        let now = Instant::now();
        let result = {
            let mut tracker = Tracker {
                inner: events,
                handles: &mut self.handles,
                now,
            };
            self.transport.socket_action(trigger, &mut tracker)
        };

        match result {
            Ok(updates) => self.apply_updates(updates),
            Err(error) => {
                self.fail_all(error, events);
                return;
            }
        }

        if trigger == Trigger::Timeout {
            self.expire(now, events);
        }
        self.rearm();
    }

    /// Surface a fatal error to every registered transfer.
    fn fail_all(&mut self, error: NetError, events: &mut dyn TransferEvents) {
        tracing::warn!(error = %error, transfers = self.handles.len(), "multiplexer failed");
        self.failed = Some(error);
        let ids: Vec<TransferId> = self.handles.keys().copied().collect();
        for id in ids {
            let _ = self.transport.remove(id);
            if self.handles.remove(&id).is_some() {
                events.on_transfer_complete(id, Err(error));
            }
        }
        self.sources.clear();
        self.timer.cancel();
        self.kick_pending = false;
    }

    fn expire(&mut self, now: Instant, events: &mut dyn TransferEvents) {
        let expired: Vec<TransferId> = self
            .handles
            .iter()
            .filter(|(_, h)| h.deadline().is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let updates = self.transport.remove(id);
            self.apply_updates(updates);
            if self.handles.remove(&id).is_some() {
                tracing::debug!(transfer = %id, "transfer timed out");
                events.on_transfer_complete(id, Err(NetError::TimedOut));
            }
        }
    }

    fn kick(&mut self) {
        self.kick_pending = true;
        self.timer.arm(Duration::ZERO, || Trigger::Timeout);
    }

    /// Arm the shared timer for the soonest deadline.
    fn rearm(&mut self) {
        if self.kick_pending {
            return;
        }
        let now = Instant::now();
        let soonest_handle = self.handles.values().filter_map(|h| h.deadline()).min();
        let transport = self.transport.timeout().map(|d| now + d);
        let soonest = match (soonest_handle, transport) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match soonest {
            Some(deadline) => self
                .timer
                .arm(deadline.saturating_duration_since(now), || Trigger::Timeout),
            None => self.timer.cancel(),
        }
    }

    fn apply_updates(&mut self, updates: Vec<SocketUpdate>) {
        for SocketUpdate { socket, interest } in updates {
            if interest == SocketInterest::Remove {
                if self.sources.remove(&socket).is_some() {
                    tracing::trace!(socket = %socket, "watchers removed");
                }
                continue;
            }
            let sources = self.sources.entry(socket).or_default();
            if sources.read != interest.needs_read() || sources.write != interest.needs_write() {
                sources.read = interest.needs_read();
                sources.write = interest.needs_write();
                tracing::trace!(socket = %socket, ?interest, "socket interest updated");
            }
        }
    }
}

impl<T: Transport> std::fmt::Debug for Multiplexer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("handles", &self.handles.len())
            .field("watchers", &self.watcher_count())
            .field("timer", &self.timer)
            .field("failed", &self.failed)
            .finish()
    }
}

/// Wraps the caller's callbacks to keep handle bookkeeping in step with
/// what the transport reports.
struct Tracker<'a> {
    inner: &'a mut dyn TransferEvents,
    handles: &'a mut HashMap<TransferId, TransferHandle>,
    now: Instant,
}

impl Tracker<'_> {
    fn observe(&mut self, id: TransferId, action: HandleAction) -> HandleAction {
        if let Some(handle) = self.handles.get_mut(&id) {
            if action == HandleAction::Pause {
                let mut pause = handle.pause_state();
                pause.receive = true;
                handle.set_pause(pause, self.now);
            } else {
                handle.touch(self.now);
            }
        }
        action
    }
}

impl TransferEvents for Tracker<'_> {
    fn on_header_data(
        &mut self,
        id: TransferId,
        line: &[u8],
        content_length: Option<u64>,
    ) -> HandleAction {
        if !self.handles.contains_key(&id) {
            return HandleAction::Abort;
        }
        let action = self.inner.on_header_data(id, line, content_length);
        self.observe(id, action)
    }

    fn on_body_data(&mut self, id: TransferId, data: &[u8]) -> HandleAction {
        if !self.handles.contains_key(&id) {
            return HandleAction::Abort;
        }
        let action = self.inner.on_body_data(id, data);
        self.observe(id, action)
    }

    fn on_need_outbound(&mut self, id: TransferId, max: usize) -> BodyChunk {
        let Some(handle) = self.handles.get_mut(&id) else {
            return BodyChunk::Error(NetError::Cancelled);
        };
        handle.touch(self.now);
        let chunk = self.inner.on_need_outbound(id, max);
        if chunk == BodyChunk::RetryLater {
            if let Some(handle) = self.handles.get_mut(&id) {
                let mut pause = handle.pause_state();
                pause.send = true;
                handle.set_pause(pause, self.now);
            }
        }
        chunk
    }

    fn on_seek(&mut self, id: TransferId, position: u64) -> bool {
        self.handles.contains_key(&id) && self.inner.on_seek(id, position)
    }

    fn on_transfer_complete(&mut self, id: TransferId, result: Result<(), NetError>) {
        if self.handles.remove(&id).is_none() {
            return;
        }
        if let Err(e) = &result {
            tracing::debug!(transfer = %id, error = %e, code = e.as_i32(), "transfer failed");
        }
        self.inner.on_transfer_complete(id, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::poll_fn;
    use std::collections::HashSet;
    use url::Url;

    /// Scripted transport: every timeout completes the transfers listed in
    /// `complete_on_timeout`, sockets are assigned by the test.
    #[derive(Default)]
    struct MockTransport {
        added: Vec<TransferId>,
        removed: Vec<TransferId>,
        complete_on_timeout: bool,
        fail_next: Option<NetError>,
        pending_updates: Vec<SocketUpdate>,
        paused: HashMap<TransferId, PauseState>,
    }

    impl Transport for MockTransport {
        fn add(&mut self, id: TransferId, _config: &crate::socket::handle::TransferConfig) -> Result<(), NetError> {
            self.added.push(id);
            Ok(())
        }

        fn remove(&mut self, id: TransferId) -> Vec<SocketUpdate> {
            self.removed.push(id);
            self.added.retain(|a| *a != id);
            Vec::new()
        }

        fn set_pause(&mut self, id: TransferId, pause: PauseState) -> Vec<SocketUpdate> {
            self.paused.insert(id, pause);
            Vec::new()
        }

        fn socket_action(
            &mut self,
            trigger: Trigger,
            events: &mut dyn TransferEvents,
        ) -> Result<Vec<SocketUpdate>, NetError> {
            if let Some(e) = self.fail_next.take() {
                return Err(e);
            }
            if trigger == Trigger::Timeout && self.complete_on_timeout {
                for id in std::mem::take(&mut self.added) {
                    events.on_header_data(id, b"HTTP/1.1 200 OK\r\n", None);
                    events.on_transfer_complete(id, Ok(()));
                    // A second completion must never reach the caller
                    events.on_transfer_complete(id, Ok(()));
                }
            }
            Ok(std::mem::take(&mut self.pending_updates))
        }

        fn poll_socket(&mut self, _: SocketId, _: Readiness, _: &mut Context<'_>) -> Poll<()> {
            Poll::Pending
        }

        fn timeout(&self) -> Option<Duration> {
            None
        }
    }

    #[derive(Default)]
    struct Recorder {
        completed: Vec<(TransferId, Result<(), NetError>)>,
        headers: usize,
    }

    impl TransferEvents for Recorder {
        fn on_header_data(&mut self, _: TransferId, _: &[u8], _: Option<u64>) -> HandleAction {
            self.headers += 1;
            HandleAction::Proceed
        }
        fn on_body_data(&mut self, _: TransferId, _: &[u8]) -> HandleAction {
            HandleAction::Proceed
        }
        fn on_need_outbound(&mut self, _: TransferId, _: usize) -> BodyChunk {
            BodyChunk::Done
        }
        fn on_seek(&mut self, _: TransferId, _: u64) -> bool {
            true
        }
        fn on_transfer_complete(&mut self, id: TransferId, result: Result<(), NetError>) {
            self.completed.push((id, result));
        }
    }

    fn handle(timeout: Duration) -> TransferHandle {
        let mut h = TransferHandle::new(Url::parse("http://example.com/").unwrap());
        h.set_timeout(timeout);
        h
    }

    #[tokio::test(start_paused = true)]
    async fn test_hundred_transfers_complete_once() {
        let mut mux = Multiplexer::new(MockTransport {
            complete_on_timeout: true,
            ..Default::default()
        });
        let mut ids = HashSet::new();
        for _ in 0..100 {
            let h = handle(Duration::ZERO);
            ids.insert(h.id());
            mux.register(h).unwrap();
        }

        let mut recorder = Recorder::default();
        let trigger = poll_fn(|cx| mux.poll_event(cx)).await;
        assert_eq!(trigger, Trigger::Timeout);
        mux.pump(trigger, &mut recorder);

        assert_eq!(recorder.completed.len(), 100);
        assert_eq!(recorder.headers, 100);
        let seen: HashSet<TransferId> = recorder.completed.iter().map(|(id, _)| *id).collect();
        assert_eq!(seen, ids);
        assert!(mux.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_reaches_every_handle() {
        let mut mux = Multiplexer::new(MockTransport::default());
        for _ in 0..3 {
            mux.register(handle(Duration::ZERO)).unwrap();
        }
        mux.transport.fail_next = Some(NetError::Failed);

        let mut recorder = Recorder::default();
        mux.pump(Trigger::Timeout, &mut recorder);
        assert_eq!(recorder.completed.len(), 3);
        assert!(recorder
            .completed
            .iter()
            .all(|(_, r)| *r == Err(NetError::Failed)));
        assert_eq!(mux.failure(), Some(NetError::Failed));

        let err = mux.register(handle(Duration::ZERO)).unwrap_err();
        assert_eq!(err, NetError::MultiplexerFailed);

        mux.reset();
        assert!(mux.register(handle(Duration::ZERO)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_is_idempotent() {
        let mut mux = Multiplexer::new(MockTransport::default());
        let h = handle(Duration::ZERO);
        let id = h.id();
        mux.register(h).unwrap();

        assert!(mux.unregister(id).is_some());
        assert!(mux.unregister(id).is_none());
        assert_eq!(mux.transport().removed, vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchers_keyed_by_socket() {
        let mut mux = Multiplexer::new(MockTransport::default());
        let shared = SocketId(1);
        mux.transport.pending_updates = vec![
            SocketUpdate {
                socket: shared,
                interest: SocketInterest::Read,
            },
            // A second transfer on the same socket adds write interest only
            SocketUpdate {
                socket: shared,
                interest: SocketInterest::ReadWrite,
            },
            SocketUpdate {
                socket: SocketId(2),
                interest: SocketInterest::Write,
            },
        ];
        let mut recorder = Recorder::default();
        mux.pump(Trigger::Timeout, &mut recorder);
        assert_eq!(mux.watcher_count(), (1, 2));

        mux.transport.pending_updates = vec![
            SocketUpdate {
                socket: shared,
                interest: SocketInterest::Write,
            },
            SocketUpdate {
                socket: SocketId(2),
                interest: SocketInterest::Remove,
            },
        ];
        mux.pump(Trigger::Timeout, &mut recorder);
        assert_eq!(mux.watcher_count(), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let mut mux = Multiplexer::new(MockTransport::default());
        let h = handle(Duration::from_secs(2));
        let id = h.id();
        mux.register(h).unwrap();

        let mut recorder = Recorder::default();
        // Kick from registration
        let trigger = poll_fn(|cx| mux.poll_event(cx)).await;
        mux.pump(trigger, &mut recorder);
        assert!(recorder.completed.is_empty());

        let start = Instant::now();
        let trigger = poll_fn(|cx| mux.poll_event(cx)).await;
        assert_eq!(trigger, Trigger::Timeout);
        assert!(start.elapsed() >= Duration::from_secs(1));
        mux.pump(trigger, &mut recorder);
        assert_eq!(recorder.completed, vec![(id, Err(NetError::TimedOut))]);
        assert!(!mux.is_registered(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_handle_does_not_expire() {
        let mut mux = Multiplexer::new(MockTransport::default());
        let h = handle(Duration::from_secs(1));
        let id = h.id();
        mux.register(h).unwrap();
        mux.set_pause(
            id,
            PauseState {
                receive: true,
                send: false,
            },
        );

        let mut recorder = Recorder::default();
        let trigger = poll_fn(|cx| mux.poll_event(cx)).await;
        mux.pump(trigger, &mut recorder);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let next = tokio::time::timeout(Duration::from_secs(5), poll_fn(|cx| mux.poll_event(cx)))
            .await;
        assert!(next.is_err());
        assert!(mux.is_registered(id));

        mux.set_pause(id, PauseState::default());
        assert_eq!(mux.transport().paused.get(&id), Some(&PauseState::default()));
    }
}
