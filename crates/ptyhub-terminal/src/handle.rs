use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ptyhub_types::{ExitInfo, ProcessState, StatusUpdate, TerminalKind, TerminalStatus};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use super::backend::ProcessControl;
use super::scrollback::Scrollback;

pub type SubscriberId = u64;

/// Events delivered to a subscriber, in the order they were produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Output produced before the subscription began. Always first.
    Scrollback(Vec<String>),
    Output {
        data: String,
        timestamp: DateTime<Utc>,
    },
    Status(StatusUpdate),
}

/// Per-subscriber outbound queue. Bounded; a subscriber whose queue fills
/// up is dropped so that a stalled viewer neither holds up delivery to the
/// others nor buffers output without limit.
pub type EventSink = mpsc::Sender<TerminalEvent>;

struct HandleInner {
    state: ProcessState,
    exit: Option<ExitInfo>,
    error: Option<String>,
    exit_requested: bool,
    reap_scheduled: bool,
    last_activity_at: DateTime<Utc>,
    cols: u16,
    rows: u16,
    scrollback: Scrollback,
    subscribers: BTreeMap<SubscriberId, EventSink>,
    next_subscriber: SubscriberId,
}

/// One spawned pseudo-terminal process and everything attached to it.
///
/// Owned by [`PtyManager`](crate::PtyManager); connections only ever hold an
/// `Arc` to it through a [`Subscription`].
pub struct ProcessHandle {
    session_id: String,
    kind: TerminalKind,
    pid: Option<u32>,
    started_by: Option<String>,
    created_at: DateTime<Utc>,
    control: Box<dyn ProcessControl>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    state_tx: watch::Sender<ProcessState>,
    inner: Mutex<HandleInner>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("session_id", &self.session_id)
            .field("kind", &self.kind)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl ProcessHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: String,
        kind: TerminalKind,
        pid: Option<u32>,
        started_by: Option<String>,
        control: Box<dyn ProcessControl>,
        input: mpsc::UnboundedSender<Vec<u8>>,
        size: (u16, u16),
        scrollback_bytes: usize,
    ) -> Self {
        let now = Utc::now();
        let (state_tx, _) = watch::channel(ProcessState::Starting);
        Self {
            session_id,
            kind,
            pid,
            started_by,
            created_at: now,
            control,
            input,
            state_tx,
            inner: Mutex::new(HandleInner {
                state: ProcessState::Starting,
                exit: None,
                error: None,
                exit_requested: false,
                reap_scheduled: false,
                last_activity_at: now,
                cols: size.0,
                rows: size.1,
                scrollback: Scrollback::new(scrollback_bytes),
                subscribers: BTreeMap::new(),
                next_subscriber: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn kind(&self) -> &TerminalKind {
        &self.kind
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ProcessState {
        self.lock().state
    }

    pub fn exit(&self) -> Option<ExitInfo> {
        self.lock().exit
    }

    pub fn size(&self) -> (u16, u16) {
        let inner = self.lock();
        (inner.cols, inner.rows)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Copy of the buffered output
    pub fn scrollback(&self) -> Vec<String> {
        self.lock().scrollback.snapshot()
    }

    pub fn status(&self) -> TerminalStatus {
        let inner = self.lock();
        TerminalStatus {
            session_id: self.session_id.clone(),
            terminal: self.kind.clone(),
            running: inner.state.is_live(),
            status: inner.state,
            pid: self.pid,
            exit_code: inner.exit.and_then(|exit| exit.code),
            error: inner.error.clone(),
            started_by: self.started_by.clone(),
            cols: inner.cols,
            rows: inner.rows,
            subscribers: inner.subscribers.len(),
            created_at: self.created_at,
            last_activity_at: inner.last_activity_at,
        }
    }

    fn status_update(&self, inner: &HandleInner) -> StatusUpdate {
        StatusUpdate {
            status: inner.state,
            pid: self.pid,
            exit_code: inner.exit.and_then(|exit| exit.code),
            error: inner.error.clone(),
        }
    }

    /// Attach a subscriber.
    ///
    /// The sink first receives the buffered scrollback, then the current
    /// status, then every event produced afterwards. Snapshot and
    /// registration happen under one lock, so nothing emitted concurrently
    /// is missed or delivered twice.
    pub fn subscribe(self: &Arc<Self>, sink: EventSink) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;

        let replay = sink
            .try_send(TerminalEvent::Scrollback(inner.scrollback.snapshot()))
            .and_then(|()| sink.try_send(TerminalEvent::Status(self.status_update(&inner))));
        match replay {
            Ok(()) => {
                inner.subscribers.insert(id, sink);
            }
            Err(e) => tracing::warn!(
                session_id = %self.session_id,
                kind = %self.kind,
                subscriber = id,
                error = %e,
                "subscriber queue cannot hold the replay, not attaching"
            ),
        }

        tracing::debug!(
            session_id = %self.session_id,
            kind = %self.kind,
            subscriber = id,
            subscribers = inner.subscribers.len(),
            "subscriber attached"
        );

        Subscription {
            handle: Arc::clone(self),
            id,
        }
    }

    fn unsubscribe(&self, id: SubscriberId) {
        let mut inner = self.lock();
        if inner.subscribers.remove(&id).is_some() {
            tracing::debug!(
                session_id = %self.session_id,
                kind = %self.kind,
                subscriber = id,
                subscribers = inner.subscribers.len(),
                "subscriber detached"
            );
        }
    }

    /// Fan an event out to every subscriber, dropping those that have gone
    /// away or whose queue is full
    fn broadcast(&self, inner: &mut HandleInner, event: TerminalEvent) {
        inner
            .subscribers
            .retain(|id, sink| match sink.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        kind = %self.kind,
                        subscriber = *id,
                        "subscriber fell behind, dropping it"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }

    pub(crate) fn publish_output(&self, data: String) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.lock();
        let timestamp = Utc::now();
        inner.last_activity_at = timestamp;
        inner.scrollback.push(&data);
        self.broadcast(&mut inner, TerminalEvent::Output { data, timestamp });
    }

    /// Move to a new live state. `exited` is terminal and only reachable
    /// through [`mark_exited`](Self::mark_exited).
    pub(crate) fn transition(&self, to: ProcessState) -> bool {
        let mut inner = self.lock();
        let allowed = matches!(
            (inner.state, to),
            (ProcessState::Starting, ProcessState::Running)
                | (ProcessState::Starting, ProcessState::Stopping)
                | (ProcessState::Running, ProcessState::Stopping)
        );
        if !allowed {
            return false;
        }
        inner.state = to;
        let update = self.status_update(&inner);
        self.broadcast(&mut inner, TerminalEvent::Status(update));
        drop(inner);
        self.state_tx.send_replace(to);
        true
    }

    /// Record the end of the process. Returns false if it had already ended.
    pub(crate) fn mark_exited(&self, exit: ExitInfo) -> bool {
        let mut inner = self.lock();
        if inner.state == ProcessState::Exited {
            return false;
        }
        inner.state = ProcessState::Exited;
        inner.exit = Some(exit);
        inner.last_activity_at = Utc::now();
        if inner.error.is_none() && !inner.exit_requested && !exit.success() {
            inner.error = Some(match exit.code {
                Some(code) => format!("process exited unexpectedly with code {}", code),
                None => "process exited unexpectedly".to_string(),
            });
        }
        let update = self.status_update(&inner);
        if update.error.is_some() {
            tracing::warn!(
                session_id = %self.session_id,
                kind = %self.kind,
                pid = ?self.pid,
                exit_code = ?exit.code,
                "terminal process crashed"
            );
        } else {
            tracing::info!(
                session_id = %self.session_id,
                kind = %self.kind,
                pid = ?self.pid,
                exit_code = ?exit.code,
                "terminal process exited"
            );
        }
        self.broadcast(&mut inner, TerminalEvent::Status(update));
        drop(inner);
        self.state_tx.send_replace(ProcessState::Exited);
        true
    }

    /// Note that the coming exit was asked for, so it is not a crash.
    /// Returns whether it had already been requested.
    pub(crate) fn request_exit(&self) -> bool {
        std::mem::replace(&mut self.lock().exit_requested, true)
    }

    /// Undo [`request_exit`](Self::request_exit) after the request could not
    /// be delivered
    pub(crate) fn withdraw_exit_request(&self) {
        let mut inner = self.lock();
        if inner.state != ProcessState::Exited {
            inner.exit_requested = false;
        }
    }

    /// Record a mid-life fault; it becomes the error of the final status
    pub(crate) fn record_fault(&self, message: String) {
        let mut inner = self.lock();
        if inner.error.is_none() {
            inner.error = Some(message);
        }
    }

    /// Claim the right to schedule removal; true exactly once
    pub(crate) fn claim_reap(&self) -> bool {
        let mut inner = self.lock();
        !std::mem::replace(&mut inner.reap_scheduled, true)
    }

    /// Drop buffered output once the handle leaves the table
    pub(crate) fn retire(&self) {
        self.lock().scrollback.clear();
    }

    /// Queue bytes for the process's input. Dropped unless running.
    pub(crate) fn send_input(&self, data: Vec<u8>) -> bool {
        let mut inner = self.lock();
        if inner.state != ProcessState::Running {
            return false;
        }
        inner.last_activity_at = Utc::now();
        self.input.send(data).is_ok()
    }

    pub(crate) fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.control.resize(cols, rows)?;
        let mut inner = self.lock();
        inner.cols = cols;
        inner.rows = rows;
        Ok(())
    }

    pub(crate) fn control(&self) -> &dyn ProcessControl {
        self.control.as_ref()
    }

    /// Wait until the process has exited, up to `timeout`
    pub(crate) async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let exited = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| *state == ProcessState::Exited)
                .await
                .is_ok()
        })
        .await;
        exited.unwrap_or(false)
    }
}

/// A live attachment to a [`ProcessHandle`]. Dropping it unsubscribes.
pub struct Subscription {
    handle: Arc<ProcessHandle>,
    id: SubscriberId,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unsubscribe(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}
