// Network surfaces: streaming protocol and HTTP control API
pub mod protocol;
pub mod routes;
pub mod server;
pub mod ws;

pub use protocol::{codes, ClientMessage, ServerMessage};
pub use routes::{control_router, AppError, AppState};
pub use server::{streaming_router, Servers};
pub use ws::{Handshake, MAX_CONSECUTIVE_FAULTS};
