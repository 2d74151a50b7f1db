//! Process spawning abstraction, so the manager can drive real pseudo-terminals
//! in production and scripted processes in tests

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::Result;
use ptyhub_types::{ExitInfo, Signal};

/// Everything needed to launch one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Extra environment on top of the server's own
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// A freshly spawned process, split into the pieces the manager's pump
/// threads take ownership of
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn ProcessControl>,
    pub waiter: Box<dyn ExitWaiter>,
}

/// Out-of-band control over a running process
pub trait ProcessControl: Send + Sync {
    /// Propagate new terminal dimensions
    fn resize(&self, cols: u16, rows: u16) -> io::Result<()>;

    /// Deliver a signal to the process
    fn signal(&self, signal: Signal) -> io::Result<()>;

    /// Hard kill
    fn kill(&self) -> io::Result<()>;
}

/// Blocks until the process exits
pub trait ExitWaiter: Send {
    fn wait(self: Box<Self>) -> io::Result<ExitInfo>;
}

/// Creates processes attached to a terminal
pub trait ProcessSpawner: Send + Sync {
    /// Spawn synchronously. Failures (missing executable, permission denied,
    /// bad working directory) must be reported here, not later.
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess>;

    /// Spawner name for debugging
    fn name(&self) -> &str;
}
