#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ptyhub_terminal::{
    ExitWaiter, KindRegistry, KindSpec, ManagerConfig, ProcessControl, ProcessSpawner, PtyManager,
    SpawnRequest, SpawnedProcess,
};
use ptyhub_types::{ExitInfo, Signal, TerminalKind};
use tempfile::TempDir;

/// How a scripted process reacts
#[derive(Debug, Clone, Copy, Default)]
pub struct Behavior {
    /// SIGHUP is recorded but does nothing
    pub ignore_hangup: bool,
    /// Kill is recorded but the process never exits
    pub unkillable: bool,
    /// Every spawn fails
    pub fail_spawn: bool,
    /// Writes to the process fail with a broken pipe
    pub broken_input: bool,
    /// Input is echoed back as output, like a tty in cooked mode
    pub echo: bool,
    /// Signal delivery fails, as if the pid were already gone
    pub failing_signals: bool,
}

/// A scripted process the test drives by hand
pub struct FakeProcess {
    pub pid: u32,
    pub request: SpawnRequest,
    behavior: Behavior,
    output: Mutex<Option<std_mpsc::Sender<Vec<u8>>>>,
    exit: Mutex<Option<std_mpsc::Sender<ExitInfo>>>,
    pub input: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    pub signals: Mutex<Vec<Signal>>,
    pub kills: AtomicU32,
}

impl FakeProcess {
    /// Produce output, as if the process had written to its terminal
    pub fn emit(&self, data: &str) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.send(data.as_bytes().to_vec());
        }
    }

    /// End the process with an exit code
    pub fn exit(&self, code: i32) {
        self.output.lock().unwrap().take();
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(ExitInfo::with_code(code));
        }
    }

    pub fn input_text(&self) -> String {
        String::from_utf8_lossy(&self.input.lock().unwrap()).into_owned()
    }

    pub fn kill_count(&self) -> u32 {
        self.kills.load(Ordering::SeqCst)
    }
}

struct ChannelReader {
    rx: std_mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(data) => self.pending = data,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct FakeWriter {
    process: Arc<FakeProcess>,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.process.behavior.broken_input {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        self.process.input.lock().unwrap().extend_from_slice(buf);
        if self.process.behavior.echo {
            self.process.emit(&String::from_utf8_lossy(buf));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FakeControl {
    process: Arc<FakeProcess>,
}

impl ProcessControl for FakeControl {
    fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        self.process.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        self.process.signals.lock().unwrap().push(signal);
        if self.process.behavior.failing_signals {
            return Err(io::Error::other("No such process (os error 3)"));
        }
        let code = match signal {
            Signal::Hangup if self.process.behavior.ignore_hangup => return Ok(()),
            Signal::Hangup => 129,
            Signal::Interrupt => 130,
            Signal::Quit => 131,
            Signal::Kill => 137,
            Signal::Terminate => 143,
        };
        self.process.exit(code);
        Ok(())
    }

    fn kill(&self) -> io::Result<()> {
        self.process.kills.fetch_add(1, Ordering::SeqCst);
        if !self.process.behavior.unkillable {
            self.process.exit(137);
        }
        Ok(())
    }
}

struct FakeWaiter {
    rx: std_mpsc::Receiver<ExitInfo>,
}

impl ExitWaiter for FakeWaiter {
    fn wait(self: Box<Self>) -> io::Result<ExitInfo> {
        self.rx
            .recv()
            .map_err(|_| io::Error::other("process vanished"))
    }
}

/// Spawner handing out scripted processes
#[derive(Default)]
pub struct FakeSpawner {
    behavior: Behavior,
    next_pid: AtomicU32,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
}

impl FakeSpawner {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            next_pid: AtomicU32::new(1000),
            processes: Mutex::new(Vec::new()),
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    pub fn process(&self, index: usize) -> Arc<FakeProcess> {
        Arc::clone(&self.processes.lock().unwrap()[index])
    }

    pub fn last(&self) -> Arc<FakeProcess> {
        Arc::clone(self.processes.lock().unwrap().last().expect("nothing spawned"))
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> anyhow::Result<SpawnedProcess> {
        if self.behavior.fail_spawn {
            anyhow::bail!("No such file or directory (os error 2)");
        }

        let (output_tx, output_rx) = std_mpsc::channel();
        let (exit_tx, exit_rx) = std_mpsc::channel();
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        let process = Arc::new(FakeProcess {
            pid,
            request: request.clone(),
            behavior: self.behavior,
            output: Mutex::new(Some(output_tx)),
            exit: Mutex::new(Some(exit_tx)),
            input: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            kills: AtomicU32::new(0),
        });
        self.processes.lock().unwrap().push(Arc::clone(&process));

        Ok(SpawnedProcess {
            pid: Some(pid),
            reader: Box::new(ChannelReader {
                rx: output_rx,
                pending: Vec::new(),
            }),
            writer: Box::new(FakeWriter {
                process: Arc::clone(&process),
            }),
            control: Box::new(FakeControl {
                process: Arc::clone(&process),
            }),
            waiter: Box::new(FakeWaiter { rx: exit_rx }),
        })
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Manager over a scripted spawner, rooted in a fresh temp dir
pub struct TestFixture {
    pub root: TempDir,
    pub spawner: Arc<FakeSpawner>,
    pub manager: Arc<PtyManager>,
}

impl TestFixture {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_config(behavior, |_| {})
    }

    pub fn with_config(behavior: Behavior, tweak: impl FnOnce(&mut ManagerConfig)) -> Self {
        let root = TempDir::new().expect("Failed to create temp directory");
        let mut config = ManagerConfig::new(root.path());
        config.stop_grace = Duration::from_millis(200);
        config.kill_timeout = Duration::from_millis(200);
        config.retain_exited = Duration::from_secs(60);
        config.shutdown_timeout = Duration::from_millis(500);
        tweak(&mut config);

        let kinds = KindRegistry::builtin()
            .with_kind(TerminalKind::shell(), KindSpec::new("/bin/sh").with_args(["-i"]));
        let spawner = FakeSpawner::new(behavior);
        let manager = PtyManager::with_spawner(config, kinds, spawner.clone())
            .expect("Failed to create manager");

        Self {
            root,
            spawner,
            manager: Arc::new(manager),
        }
    }

    pub fn workdir(&self) -> &std::path::Path {
        self.root.path()
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
