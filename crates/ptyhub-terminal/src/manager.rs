use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use ptyhub_types::{
    ExitInfo, ProcessState, Signal, StartConfig, TerminalKind, TerminalStatus, DEFAULT_COLS,
    DEFAULT_ROWS,
};
use tokio::sync::{mpsc, Mutex};

use super::backend::{ProcessSpawner, SpawnRequest};
use super::error::{Result, TerminalError};
use super::handle::{EventSink, ProcessHandle, Subscription, TerminalEvent};
use super::kinds::KindRegistry;
use super::pty_backend::PtySpawner;
use super::pump;
use super::{
    DEFAULT_KILL_TIMEOUT_MS, DEFAULT_RETAIN_EXITED_SECS, DEFAULT_SCROLLBACK_BYTES,
    DEFAULT_SHUTDOWN_TIMEOUT_MS, DEFAULT_STOP_GRACE_MS, DEFAULT_SUBSCRIBER_QUEUE, MAX_SESSION_ID_LEN,
};

/// Terminal interrupt character (Ctrl-C); the line discipline turns it into
/// SIGINT for the foreground job
const INTERRUPT: u8 = 0x03;

type ProcessKey = (String, TerminalKind);
type ProcessTable = Arc<RwLock<HashMap<ProcessKey, Arc<ProcessHandle>>>>;

/// Tunables for [`PtyManager`]
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Every working directory must resolve inside this directory
    pub root: PathBuf,
    pub scrollback_bytes: usize,
    /// Wait after the graceful hangup before killing
    pub stop_grace: Duration,
    /// Wait after a kill before declaring the process gone
    pub kill_timeout: Duration,
    /// How long an exited process stays readable once nobody watches it
    pub retain_exited: Duration,
    /// Upper bound on [`PtyManager::shutdown_all`]
    pub shutdown_timeout: Duration,
    /// Events a subscriber may have queued before it is dropped
    pub subscriber_queue: usize,
}

impl ManagerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            kill_timeout: Duration::from_millis(DEFAULT_KILL_TIMEOUT_MS),
            retain_exited: Duration::from_secs(DEFAULT_RETAIN_EXITED_SECS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedProcess {
    pub pid: Option<u32>,
    /// An instance of a non-exclusive kind was already running and was
    /// returned instead of spawning a new one
    pub reused: bool,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    AlreadyExited,
    Stopped { forced: bool },
}

/// Owns every managed pseudo-terminal process, keyed by (session, kind).
///
/// Constructed once at startup and shared (`Arc<PtyManager>`) with the HTTP
/// control API and the streaming router.
pub struct PtyManager {
    table: ProcessTable,
    /// Serialises starts so a check-then-spawn cannot race another start
    starts: Mutex<()>,
    spawner: Arc<dyn ProcessSpawner>,
    kinds: KindRegistry,
    config: ManagerConfig,
}

impl std::fmt::Debug for PtyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyManager")
            .field("spawner", &self.spawner.name())
            .field("root", &self.config.root)
            .field("processes", &self.process_count())
            .finish()
    }
}

impl PtyManager {
    /// Create a manager that spawns real pseudo-terminals
    pub fn new(config: ManagerConfig, kinds: KindRegistry) -> Result<Self> {
        Self::with_spawner(config, kinds, Arc::new(PtySpawner::new()))
    }

    /// Create a manager with a specific spawner
    pub fn with_spawner(
        mut config: ManagerConfig,
        kinds: KindRegistry,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Result<Self> {
        config.root = config.root.canonicalize().map_err(|e| {
            TerminalError::validation(format!(
                "root directory '{}' is not usable: {}",
                config.root.display(),
                e
            ))
        })?;
        if !config.root.is_dir() {
            return Err(TerminalError::validation(format!(
                "root '{}' is not a directory",
                config.root.display()
            )));
        }

        tracing::debug!(spawner = spawner.name(), root = %config.root.display(), "process manager ready");

        Ok(Self {
            table: Arc::new(RwLock::new(HashMap::new())),
            starts: Mutex::new(()),
            spawner,
            kinds,
            config,
        })
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn lookup(&self, session_id: &str, kind: &TerminalKind) -> Option<Arc<ProcessHandle>> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.get(&(session_id.to_string(), kind.clone())).cloned()
    }

    fn lookup_live(&self, session_id: &str, kind: &TerminalKind) -> Option<Arc<ProcessHandle>> {
        self.lookup(session_id, kind)
            .filter(|handle| handle.state().is_live())
    }

    fn validate_session_id(session_id: &str) -> Result<()> {
        let valid = !session_id.is_empty()
            && session_id.len() <= MAX_SESSION_ID_LEN
            && session_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if valid {
            Ok(())
        } else {
            Err(TerminalError::validation(format!(
                "invalid session id '{}'",
                session_id
            )))
        }
    }

    fn validate_kind(&self, kind: &TerminalKind) -> Result<()> {
        if self.kinds.contains(kind) {
            Ok(())
        } else {
            Err(TerminalError::validation(format!(
                "unknown terminal kind '{}'",
                kind
            )))
        }
    }

    /// Resolve a requested working directory against the root and make sure
    /// it exists, is a directory and does not escape the root
    pub async fn resolve_working_directory(&self, requested: &Path) -> Result<PathBuf> {
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.config.root.join(requested)
        };

        let resolved = tokio::fs::canonicalize(&candidate).await.map_err(|e| {
            TerminalError::validation(format!(
                "working directory '{}' is not accessible: {}",
                requested.display(),
                e
            ))
        })?;

        if !resolved.starts_with(&self.config.root) {
            return Err(TerminalError::validation(format!(
                "working directory '{}' is outside the allowed root",
                requested.display()
            )));
        }

        let metadata = tokio::fs::metadata(&resolved).await?;
        if !metadata.is_dir() {
            return Err(TerminalError::validation(format!(
                "working directory '{}' is not a directory",
                requested.display()
            )));
        }

        Ok(resolved)
    }

    /// Start a terminal for a session.
    ///
    /// Exclusive kinds fail with [`TerminalError::AlreadyRunning`] while an
    /// instance is live; other kinds return the live instance's pid.
    pub async fn start_session(
        &self,
        session_id: &str,
        kind: &TerminalKind,
        working_directory: &Path,
        config: StartConfig,
        initiator_id: Option<&str>,
    ) -> Result<StartedProcess> {
        Self::validate_session_id(session_id)?;
        let spec = self
            .kinds
            .get(kind)
            .ok_or_else(|| TerminalError::validation(format!("unknown terminal kind '{}'", kind)))?
            .clone();

        let cols = config.cols.unwrap_or(DEFAULT_COLS);
        let rows = config.rows.unwrap_or(DEFAULT_ROWS);
        if cols == 0 || rows == 0 {
            return Err(TerminalError::validation(
                "terminal dimensions must be positive",
            ));
        }

        let cwd = self.resolve_working_directory(working_directory).await?;

        let _start = self.starts.lock().await;

        if let Some(existing) = self.lookup_live(session_id, kind) {
            if spec.exclusive {
                return Err(TerminalError::AlreadyRunning {
                    session_id: session_id.to_string(),
                    kind: kind.clone(),
                });
            }
            tracing::debug!(session_id, kind = %kind, pid = ?existing.pid(), "terminal already running");
            return Ok(StartedProcess {
                pid: existing.pid(),
                reused: true,
            });
        }

        let request = SpawnRequest {
            program: spec.command.clone(),
            args: spec.merged_args(&config.args),
            cwd,
            env: config.env,
            cols,
            rows,
        };

        let spawner = Arc::clone(&self.spawner);
        let spawn_request = request.clone();
        let spawned = tokio::task::spawn_blocking(move || spawner.spawn(&spawn_request))
            .await
            .map_err(|e| TerminalError::Spawn(format!("spawn task failed: {}", e)))?
            .map_err(|e| {
                tracing::warn!(session_id, kind = %kind, program = %request.program, error = %format!("{:#}", e), "spawn failed");
                TerminalError::Spawn(format!("{:#}", e))
            })?;

        let label = format!("{}-{}", session_id, kind);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = Arc::new(ProcessHandle::new(
            session_id.to_string(),
            kind.clone(),
            spawned.pid,
            initiator_id.map(str::to_string),
            spawned.control,
            input_tx,
            (cols, rows),
            self.config.scrollback_bytes,
        ));

        let pumps = pump::spawn_reader(label.clone(), spawned.reader, events_tx.clone())
            .and_then(|_| pump::spawn_writer(label.clone(), spawned.writer, input_rx, events_tx.clone()))
            .and_then(|_| pump::spawn_waiter(label, spawned.waiter, events_tx));
        if let Err(e) = pumps {
            let _ = handle.control().kill();
            return Err(TerminalError::Spawn(format!(
                "failed to start I/O threads: {}",
                e
            )));
        }

        let table = Arc::clone(&self.table);
        let retain = self.config.retain_exited;
        let dispatched = Arc::clone(&handle);
        tokio::spawn(async move {
            pump::dispatch(Arc::clone(&dispatched), events_rx).await;
            schedule_reap(table, dispatched, retain);
        });

        handle.transition(ProcessState::Running);

        let key = (session_id.to_string(), kind.clone());
        let replaced = self
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&handle));
        if let Some(previous) = replaced {
            previous.retire();
        }

        tracing::info!(
            session_id,
            kind = %kind,
            pid = ?handle.pid(),
            program = %request.program,
            cwd = %request.cwd.display(),
            initiator = ?initiator_id,
            "terminal started"
        );

        Ok(StartedProcess {
            pid: handle.pid(),
            reused: false,
        })
    }

    /// Stop a terminal. Graceful by default (hangup, then kill after the
    /// grace window); `force` kills straight away and also removes an
    /// already exited terminal from the table.
    pub async fn stop_session(
        &self,
        session_id: &str,
        kind: &TerminalKind,
        force: bool,
    ) -> Result<StopOutcome> {
        self.validate_kind(kind)?;

        let Some(handle) = self.lookup(session_id, kind) else {
            return Ok(StopOutcome::NotRunning);
        };

        if !handle.state().is_live() {
            if force {
                self.remove_if_current(&handle);
            }
            return Ok(StopOutcome::AlreadyExited);
        }

        handle.request_exit();
        handle.transition(ProcessState::Stopping);

        if !force {
            if let Err(e) = handle.control().signal(Signal::Hangup) {
                tracing::debug!(session_id, kind = %kind, error = %e, "hangup failed");
            }
            if handle.wait_exited(self.config.stop_grace).await {
                return Ok(StopOutcome::Stopped { forced: false });
            }
            tracing::warn!(
                session_id,
                kind = %kind,
                pid = ?handle.pid(),
                grace_ms = self.config.stop_grace.as_millis() as u64,
                "terminal ignored hangup, killing"
            );
        }

        self.kill_and_wait(&handle).await;
        Ok(StopOutcome::Stopped { forced: true })
    }

    async fn kill_and_wait(&self, handle: &Arc<ProcessHandle>) {
        if let Err(e) = handle.control().kill() {
            tracing::debug!(session_id = %handle.session_id(), kind = %handle.kind(), error = %e, "kill failed");
        }
        if !handle.wait_exited(self.config.kill_timeout).await {
            tracing::warn!(
                session_id = %handle.session_id(),
                kind = %handle.kind(),
                pid = ?handle.pid(),
                "no exit reported after kill, marking exited"
            );
            handle.mark_exited(ExitInfo::unknown());
            schedule_reap(Arc::clone(&self.table), Arc::clone(handle), self.config.retain_exited);
        }
    }

    /// Stop (forcefully) and drop a terminal from the table immediately
    pub async fn remove(&self, session_id: &str, kind: &TerminalKind) -> Result<bool> {
        self.validate_kind(kind)?;
        let Some(handle) = self.lookup(session_id, kind) else {
            return Ok(false);
        };
        if handle.state().is_live() {
            handle.request_exit();
            handle.transition(ProcessState::Stopping);
            self.kill_and_wait(&handle).await;
        }
        Ok(self.remove_if_current(&handle))
    }

    fn remove_if_current(&self, handle: &Arc<ProcessHandle>) -> bool {
        remove_if_current(&self.table, handle)
    }

    /// Forward raw bytes to the process input. Returns whether they were
    /// accepted; input for a terminal that is not running is dropped.
    pub fn write(&self, session_id: &str, kind: &TerminalKind, data: impl Into<Vec<u8>>) -> bool {
        match self.lookup_live(session_id, kind) {
            Some(handle) => handle.send_input(data.into()),
            None => false,
        }
    }

    /// Propagate new terminal dimensions
    pub fn resize(&self, session_id: &str, kind: &TerminalKind, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(TerminalError::validation(format!(
                "invalid terminal size {}x{}: dimensions must be positive",
                cols, rows
            )));
        }
        let handle = self
            .lookup_live(session_id, kind)
            .ok_or_else(|| TerminalError::not_running(session_id, kind))?;
        handle.resize(cols, rows)?;
        Ok(())
    }

    /// Deliver a signal without tearing the terminal down
    pub fn signal(&self, session_id: &str, kind: &TerminalKind, signal_name: &str) -> Result<()> {
        let signal: Signal = signal_name
            .parse()
            .map_err(|e: ptyhub_types::ParseError| TerminalError::validation(e.to_string()))?;
        let handle = self
            .lookup_live(session_id, kind)
            .ok_or_else(|| TerminalError::not_running(session_id, kind))?;

        tracing::debug!(session_id, kind = %kind, signal = %signal, "delivering signal");

        if !signal.requests_exit() {
            if !handle.send_input(vec![INTERRUPT]) {
                return Err(TerminalError::not_running(session_id, kind));
            }
            return Ok(());
        }

        let already_requested = handle.request_exit();
        if let Err(e) = handle.control().signal(signal) {
            if !already_requested {
                handle.withdraw_exit_request();
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn is_running(&self, session_id: &str, kind: &TerminalKind) -> bool {
        self.lookup_live(session_id, kind).is_some()
    }

    pub fn get_pid(&self, session_id: &str, kind: &TerminalKind) -> Option<u32> {
        self.lookup_live(session_id, kind)
            .and_then(|handle| handle.pid())
    }

    pub fn get_status(&self, session_id: &str, kind: &TerminalKind) -> Option<TerminalStatus> {
        self.lookup(session_id, kind).map(|handle| handle.status())
    }

    /// Status of every terminal of a session, ordered by kind
    pub fn list(&self, session_id: &str) -> Vec<TerminalStatus> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let by_kind: BTreeMap<&TerminalKind, TerminalStatus> = table
            .iter()
            .filter(|((session, _), _)| session == session_id)
            .map(|((_, kind), handle)| (kind, handle.status()))
            .collect();
        by_kind.into_values().collect()
    }

    /// Number of processes in the table, exited ones included
    pub fn process_count(&self) -> usize {
        self.table.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of live processes
    pub fn running_count(&self) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| handle.state().is_live())
            .count()
    }

    /// A subscriber queue sized by [`ManagerConfig::subscriber_queue`]
    pub fn event_channel(&self) -> (EventSink, mpsc::Receiver<TerminalEvent>) {
        mpsc::channel(self.config.subscriber_queue.max(2))
    }

    /// Attach a subscriber to a terminal. Exited terminals still in the
    /// table can be attached to, to read their final output and status.
    pub fn subscribe(
        &self,
        session_id: &str,
        kind: &TerminalKind,
        sink: EventSink,
    ) -> Result<Subscription> {
        let handle = self
            .lookup(session_id, kind)
            .ok_or_else(|| TerminalError::not_running(session_id, kind))?;
        Ok(handle.subscribe(sink))
    }

    /// Kill every process and wait for them, bounded by the shutdown timeout
    pub async fn shutdown_all(&self) {
        let live: Vec<Arc<ProcessHandle>> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| handle.state().is_live())
            .cloned()
            .collect();

        if live.is_empty() {
            return;
        }

        tracing::info!(processes = live.len(), "shutting down terminals");

        for handle in &live {
            handle.request_exit();
            handle.transition(ProcessState::Stopping);
            if let Err(e) = handle.control().kill() {
                tracing::debug!(session_id = %handle.session_id(), kind = %handle.kind(), error = %e, "kill failed");
            }
        }

        let timeout = self.config.shutdown_timeout;
        let waits = live.iter().map(|handle| handle.wait_exited(timeout));
        let _ = tokio::time::timeout(timeout, futures::future::join_all(waits)).await;

        for handle in &live {
            if handle.mark_exited(ExitInfo::unknown()) {
                tracing::warn!(
                    session_id = %handle.session_id(),
                    kind = %handle.kind(),
                    pid = ?handle.pid(),
                    "terminal did not exit before shutdown timeout"
                );
            }
        }
    }
}

fn remove_if_current(table: &ProcessTable, handle: &Arc<ProcessHandle>) -> bool {
    let key = (handle.session_id().to_string(), handle.kind().clone());
    let mut table = table.write().unwrap_or_else(PoisonError::into_inner);
    match table.get(&key) {
        Some(current) if Arc::ptr_eq(current, handle) => {
            table.remove(&key);
            handle.retire();
            tracing::debug!(session_id = %handle.session_id(), kind = %handle.kind(), "terminal removed");
            true
        }
        _ => false,
    }
}

/// Remove an exited handle once it has been unwatched for the retention
/// period. Runs at most once per handle.
fn schedule_reap(table: ProcessTable, handle: Arc<ProcessHandle>, retain: Duration) {
    if !handle.claim_reap() {
        return;
    }
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(retain).await;
            let key = (handle.session_id().to_string(), handle.kind().clone());
            let still_current = table
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &handle));
            if !still_current {
                return;
            }
            if handle.subscriber_count() == 0 {
                remove_if_current(&table, &handle);
                return;
            }
        }
    });
}
