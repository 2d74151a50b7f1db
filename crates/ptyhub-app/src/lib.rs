//! ptyhub application library
//!
//! Wires the process manager to its two network surfaces: the streaming
//! WebSocket router and the HTTP control API.

pub use ptyhub_terminal::{self as terminal, KindRegistry, KindSpec, ManagerConfig, PtyManager};
pub use ptyhub_types as types;

pub mod app;
pub mod cli;
pub mod config;
pub mod resolver;
pub mod web;

pub use app::{build_state, run};
pub use cli::Cli;
pub use config::{FileConfig, SessionEntry};
pub use resolver::{
    AccessPolicy, CredentialResolver, NoCredentials, OpenSessions, SessionMetadata,
    SessionResolver, StaticCredentials, StaticSessions,
};
pub use web::{AppState, ClientMessage, ServerMessage, Servers};
