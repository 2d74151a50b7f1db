//! PTY-based process spawner (portable-pty)

use std::io;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
#[cfg(not(unix))]
use portable_pty::ChildKiller;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use ptyhub_types::{ExitInfo, Signal};

use super::backend::{ExitWaiter, ProcessControl, ProcessSpawner, SpawnRequest, SpawnedProcess};

/// Spawns processes on the host's native pseudo-terminal system
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl PtySpawner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
        let pty_system = native_pty_system();

        // Create PTY with specified size
        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        if !request.env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn '{}' in PTY", request.program))?;

        // The master must be the only open side, otherwise reads never see EOF
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        let pid = child.process_id();

        Ok(SpawnedProcess {
            pid,
            reader,
            writer,
            control: Box::new(PtyControl {
                master: Mutex::new(pair.master),
                #[cfg(not(unix))]
                killer: Mutex::new(child.clone_killer()),
                pid,
            }),
            waiter: Box::new(PtyWaiter { child }),
        })
    }

    fn name(&self) -> &str {
        "pty"
    }
}

struct PtyControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    #[cfg(not(unix))]
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyControl {
    #[cfg(unix)]
    fn pid(&self) -> io::Result<libc::pid_t> {
        self.pid
            .map(|pid| pid as libc::pid_t)
            .ok_or_else(|| io::Error::other("process id is not known"))
    }
}

impl ProcessControl for PtyControl {
    fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| io::Error::other(format!("Failed to resize PTY: {:#}", e)))
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) -> io::Result<()> {
        let pid = self.pid()?;
        let signum = match signal {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Hangup => libc::SIGHUP,
            Signal::Quit => libc::SIGQUIT,
        };
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid, signum) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, signal: Signal) -> io::Result<()> {
        match signal {
            Signal::Interrupt => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "interrupts are delivered through the terminal input",
            )),
            _ => self.kill(),
        }
    }

    /// SIGKILL to the child's process group, then to the child itself.
    /// The child leads its own session on the pty, so its pid names the
    /// group and anything it started in the foreground goes with it.
    #[cfg(unix)]
    fn kill(&self) -> io::Result<()> {
        let pid = self.pid()?;
        // SAFETY: kill(2) has no memory-safety preconditions
        let group = unsafe { libc::kill(-pid, libc::SIGKILL) };
        let group_error = io::Error::last_os_error();
        // SAFETY: as above
        let leader = unsafe { libc::kill(pid, libc::SIGKILL) };
        if group == 0 || leader == 0 {
            Ok(())
        } else {
            Err(group_error)
        }
    }

    #[cfg(not(unix))]
    fn kill(&self) -> io::Result<()> {
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        killer.kill()
    }
}

struct PtyWaiter {
    child: Box<dyn Child + Send + Sync>,
}

impl ExitWaiter for PtyWaiter {
    fn wait(mut self: Box<Self>) -> io::Result<ExitInfo> {
        let status = self.child.wait()?;
        Ok(ExitInfo::with_code(status.exit_code() as i32))
    }
}
