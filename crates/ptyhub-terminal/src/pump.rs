// Per-process I/O pump
//
// Three blocking threads per process (reader, writer, exit waiter) feed one
// async dispatch task. The dispatch task is the only place process events are
// applied to the handle, which keeps fan-out order equal to emission order.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ptyhub_types::ExitInfo;
use tokio::sync::mpsc;

use super::backend::ExitWaiter;
use super::handle::ProcessHandle;

/// How long to keep draining output after the process has exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug)]
pub(crate) enum ProcessEvent {
    Output(String),
    ReaderClosed(Option<io::Error>),
    InputFailed(io::Error),
    Exited(io::Result<ExitInfo>),
}

/// Incremental UTF-8 decoding across read boundaries. A multi-byte sequence
/// split between two reads is carried over instead of being replaced.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        None => {
                            // Incomplete sequence at the end, wait for more
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Whatever is left when the stream ends
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// On Linux a pty master reports EIO once the last slave descriptor closes;
/// that is the normal end of stream, not a fault.
fn is_hangup(error: &io::Error) -> bool {
    #[cfg(unix)]
    {
        error.raw_os_error() == Some(libc::EIO)
    }
    #[cfg(not(unix))]
    {
        let _ = error;
        false
    }
}

pub(crate) fn spawn_reader(
    label: String,
    mut reader: Box<dyn Read + Send>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("pty-read-{}", label))
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            let mut decoder = Utf8Decoder::default();
            let outcome = loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break None,
                    Ok(n) => {
                        let data = decoder.decode(&buffer[..n]);
                        if !data.is_empty() && events.send(ProcessEvent::Output(data)).is_err() {
                            break None;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if is_hangup(&e) => break None,
                    Err(e) => break Some(e),
                }
            };
            let rest = decoder.finish();
            if !rest.is_empty() {
                let _ = events.send(ProcessEvent::Output(rest));
            }
            let _ = events.send(ProcessEvent::ReaderClosed(outcome));
        })
}

/// Writes queued input in arrival order; concurrent writers interleave
pub(crate) fn spawn_writer(
    label: String,
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("pty-write-{}", label))
        .spawn(move || {
            while let Some(data) = input.blocking_recv() {
                let result = writer.write_all(&data).and_then(|_| writer.flush());
                if let Err(e) = result {
                    let _ = events.send(ProcessEvent::InputFailed(e));
                    break;
                }
            }
        })
}

pub(crate) fn spawn_waiter(
    label: String,
    waiter: Box<dyn ExitWaiter>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("pty-wait-{}", label))
        .spawn(move || {
            let _ = events.send(ProcessEvent::Exited(waiter.wait()));
        })
}

/// Apply process events to the handle until the process has exited
pub(crate) async fn dispatch(
    handle: Arc<ProcessHandle>,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    let mut reader_open = true;

    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Output(data) => handle.publish_output(data),
            ProcessEvent::ReaderClosed(error) => {
                reader_open = false;
                if let Some(e) = error {
                    tracing::warn!(
                        session_id = %handle.session_id(),
                        kind = %handle.kind(),
                        error = %e,
                        "terminal output failed, stopping process"
                    );
                    handle.record_fault(format!("terminal output failed: {}", e));
                    if let Err(e) = handle.control().kill() {
                        tracing::debug!(error = %e, "kill after output failure");
                    }
                }
            }
            ProcessEvent::InputFailed(e) => {
                tracing::warn!(
                    session_id = %handle.session_id(),
                    kind = %handle.kind(),
                    error = %e,
                    "terminal input failed, stopping process"
                );
                handle.record_fault(format!("terminal input failed: {}", e));
                if let Err(e) = handle.control().kill() {
                    tracing::debug!(error = %e, "kill after input failure");
                }
            }
            ProcessEvent::Exited(result) => {
                if reader_open {
                    drain_output(&handle, &mut events).await;
                }
                let exit = result.unwrap_or_else(|e| {
                    tracing::warn!(
                        session_id = %handle.session_id(),
                        kind = %handle.kind(),
                        error = %e,
                        "failed to collect exit status"
                    );
                    ExitInfo::unknown()
                });
                handle.mark_exited(exit);
                return;
            }
        }
    }

    // Every sender is gone without an exit report
    handle.mark_exited(ExitInfo::unknown());
}

async fn drain_output(
    handle: &ProcessHandle,
    events: &mut mpsc::UnboundedReceiver<ProcessEvent>,
) {
    let drain = async {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output(data) => handle.publish_output(data),
                ProcessEvent::ReaderClosed(_) => break,
                _ => {}
            }
        }
    };
    let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await;
}
