// Terminal process management
//
// This crate owns pseudo-terminal backed child processes keyed by
// (session, terminal kind), keeps a bounded scrollback per process and fans
// process output and lifecycle changes out to any number of subscribers.

mod error;
mod handle;
mod kinds;
mod manager;
mod pump;
mod pty_backend;
mod scrollback;
pub mod backend;

// Re-export public API
pub use backend::{ExitWaiter, ProcessControl, ProcessSpawner, SpawnRequest, SpawnedProcess};
pub use error::{Result, TerminalError};
pub use handle::{EventSink, ProcessHandle, SubscriberId, Subscription, TerminalEvent};
pub use kinds::{KindRegistry, KindSpec};
pub use manager::{ManagerConfig, PtyManager, StartedProcess, StopOutcome};
pub use pty_backend::PtySpawner;
pub use scrollback::Scrollback;

// Constants
pub const DEFAULT_SCROLLBACK_BYTES: usize = 256 * 1024;
pub const DEFAULT_STOP_GRACE_MS: u64 = 3_000;
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_RETAIN_EXITED_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1_024;
pub const MAX_SESSION_ID_LEN: usize = 128;
