use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ptyhub_terminal::{
    ManagerConfig, DEFAULT_KILL_TIMEOUT_MS, DEFAULT_RETAIN_EXITED_SECS, DEFAULT_SCROLLBACK_BYTES,
    DEFAULT_SHUTDOWN_TIMEOUT_MS, DEFAULT_STOP_GRACE_MS, DEFAULT_SUBSCRIBER_QUEUE,
};

/// CLI arguments for ptyhub
#[derive(Parser, Debug, Clone)]
#[command(name = "ptyhub")]
#[command(about = "Serve pseudo-terminal processes to browsers over WebSocket")]
#[command(version)]
pub struct Cli {
    /// Address both listeners bind to
    #[arg(long, default_value = "127.0.0.1", env = "PTYHUB_BIND")]
    pub bind: IpAddr,

    /// Port of the streaming (WebSocket) listener
    #[arg(long, default_value_t = 7681, env = "PTYHUB_WS_PORT")]
    pub ws_port: u16,

    /// Port of the HTTP control listener
    #[arg(long, default_value_t = 7680, env = "PTYHUB_HTTP_PORT")]
    pub http_port: u16,

    /// Directory every working directory must lie under
    #[arg(long, value_name = "DIR", env = "PTYHUB_ROOT")]
    pub root: PathBuf,

    /// TOML file with terminal kinds, sessions and credentials
    #[arg(long, value_name = "FILE", env = "PTYHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Scrollback kept per terminal, in bytes
    #[arg(long, default_value_t = DEFAULT_SCROLLBACK_BYTES, env = "PTYHUB_SCROLLBACK_BYTES")]
    pub scrollback_bytes: usize,

    /// Wait after a graceful hangup before killing
    #[arg(long, default_value_t = DEFAULT_STOP_GRACE_MS, env = "PTYHUB_STOP_GRACE_MS")]
    pub stop_grace_ms: u64,

    /// Wait after a kill before treating the process as gone
    #[arg(long, default_value_t = DEFAULT_KILL_TIMEOUT_MS, env = "PTYHUB_KILL_TIMEOUT_MS")]
    pub kill_timeout_ms: u64,

    /// How long an exited, unwatched terminal stays queryable
    #[arg(long, default_value_t = DEFAULT_RETAIN_EXITED_SECS, env = "PTYHUB_RETAIN_EXITED_SECS")]
    pub retain_exited_secs: u64,

    /// Upper bound on stopping every process at shutdown
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_MS, env = "PTYHUB_SHUTDOWN_TIMEOUT_MS")]
    pub shutdown_timeout_ms: u64,

    /// Events a viewer may fall behind by before it is disconnected
    #[arg(long, default_value_t = DEFAULT_SUBSCRIBER_QUEUE, env = "PTYHUB_SUBSCRIBER_QUEUE")]
    pub subscriber_queue: usize,
}

impl Cli {
    pub fn manager_config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::new(&self.root);
        config.scrollback_bytes = self.scrollback_bytes;
        config.stop_grace = Duration::from_millis(self.stop_grace_ms);
        config.kill_timeout = Duration::from_millis(self.kill_timeout_ms);
        config.retain_exited = Duration::from_secs(self.retain_exited_secs);
        config.shutdown_timeout = Duration::from_millis(self.shutdown_timeout_ms);
        config.subscriber_queue = self.subscriber_queue;
        config
    }
}
