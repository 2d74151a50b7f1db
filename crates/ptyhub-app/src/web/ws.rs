use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use ptyhub_terminal::{TerminalError, TerminalEvent};
use ptyhub_types::TerminalKind;

use super::protocol::{codes, ClientMessage, ServerMessage};
use super::routes::AppState;

/// Consecutive malformed frames tolerated before the connection is closed
pub const MAX_CONSECUTIVE_FAULTS: u32 = 5;

/// Time allowed for queued frames to flush once a connection ends
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Handshake query parameters
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub session_id: Option<String>,
    /// Defaults to the primary kind
    pub terminal: Option<String>,
    /// Identity asserted by the upstream auth layer
    pub user_id: Option<String>,
    /// Share token
    pub token: Option<String>,
}

/// The (session, kind) pair a connection is bound to for its lifetime
#[derive(Debug, Clone)]
struct Target {
    session_id: String,
    kind: TerminalKind,
}

#[derive(Debug)]
struct Rejection {
    code: &'static str,
    message: String,
}

impl Rejection {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Frames queued by the connection itself, as opposed to terminal events
enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: &'static str },
}

/// GET /ws?sessionId=&terminal=&userId=&token=
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(handshake): Query<Handshake>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, handshake))
}

async fn authorize(state: &AppState, handshake: &Handshake) -> Result<Target, Rejection> {
    let session_id = handshake
        .session_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Rejection::new(codes::SESSION_NOT_FOUND, "sessionId is required"))?;

    let metadata = match state.sessions.resolve(session_id).await {
        Ok(Some(metadata)) => metadata,
        Ok(None) => {
            return Err(Rejection::new(
                codes::SESSION_NOT_FOUND,
                format!("session '{}' not found", session_id),
            ))
        }
        Err(e) => {
            tracing::error!(session_id, error = %format!("{:#}", e), "session lookup failed");
            return Err(Rejection::new(codes::INTERNAL_ERROR, "session lookup failed"));
        }
    };

    if !metadata.allows(handshake.user_id.as_deref(), handshake.token.as_deref()) {
        return Err(Rejection::new(
            codes::UNAUTHORIZED,
            "not allowed to attach to this session",
        ));
    }

    let kinds = state.manager.kinds();
    let kind = match handshake.terminal.as_deref() {
        None | Some("") => kinds.primary().clone(),
        Some(name) => TerminalKind::new(name)
            .ok()
            .filter(|kind| kinds.contains(kind))
            .ok_or_else(|| {
                Rejection::new(
                    codes::INVALID_TERMINAL,
                    format!("unknown terminal kind '{}'", name),
                )
            })?,
    };

    Ok(Target {
        session_id: session_id.to_string(),
        kind,
    })
}

async fn reject(mut socket: WebSocket, rejection: Rejection) {
    let frame = ServerMessage::error(rejection.code, rejection.message);
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(WsMessage::Text(json)).await;
    }
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Cow::Borrowed(rejection.code),
        })))
        .await;
}

/// Handle one WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState, handshake: Handshake) {
    let connection_id = Uuid::new_v4();

    let target = match authorize(&state, &handshake).await {
        Ok(target) => target,
        Err(rejection) => {
            tracing::info!(
                connection = %connection_id,
                session_id = ?handshake.session_id,
                code = rejection.code,
                "connection rejected"
            );
            reject(socket, rejection).await;
            return;
        }
    };

    // Scrollback and current status are queued by subscribe itself
    let (events_tx, events_rx) = state.manager.event_channel();
    let subscription = match state
        .manager
        .subscribe(&target.session_id, &target.kind, events_tx)
    {
        Ok(subscription) => subscription,
        Err(e) => {
            reject(socket, Rejection::new(codes::NOT_RUNNING, e.to_string())).await;
            return;
        }
    };

    tracing::info!(
        connection = %connection_id,
        session_id = %target.session_id,
        kind = %target.kind,
        user_id = ?handshake.user_id,
        "connection attached"
    );

    let (ws_sink, mut ws_stream) = socket.split();
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();
    let mut send_task = tokio::spawn(forward_frames(ws_sink, events_rx, replies_rx));

    let mut faults = 0u32;
    loop {
        let frame = tokio::select! {
            frame = ws_stream.next() => frame,
            _ = state.shutdown.cancelled() => {
                let _ = replies_tx.send(Outbound::Close {
                    code: close_code::AWAY,
                    reason: "server shutting down",
                });
                break;
            }
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::debug!(connection = %connection_id, error = %e, "connection error");
                break;
            }
            None => break,
        };

        let parsed = match message {
            WsMessage::Text(text) => serde_json::from_str::<ClientMessage>(&text)
                .map_err(|e| format!("invalid message: {}", e)),
            WsMessage::Binary(_) => Err("binary frames are not supported".to_string()),
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };

        match parsed {
            Ok(message) => {
                faults = 0;
                if let Some(reply) = handle_client_message(&state, &target, message) {
                    let _ = replies_tx.send(Outbound::Message(reply));
                }
            }
            Err(problem) => {
                faults += 1;
                tracing::debug!(connection = %connection_id, faults, problem = %problem, "protocol fault");
                let _ = replies_tx.send(Outbound::Message(ServerMessage::error(
                    codes::BAD_MESSAGE,
                    problem,
                )));
                if faults >= MAX_CONSECUTIVE_FAULTS {
                    tracing::info!(connection = %connection_id, "closing connection after repeated protocol faults");
                    let _ = replies_tx.send(Outbound::Close {
                        code: close_code::POLICY,
                        reason: "too many malformed messages",
                    });
                    break;
                }
            }
        }
    }

    // Ends the event stream for the send task once queued frames drain
    drop(subscription);
    drop(replies_tx);
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }

    tracing::info!(
        connection = %connection_id,
        session_id = %target.session_id,
        kind = %target.kind,
        "connection closed"
    );
}

/// Write terminal events and connection replies to the socket until the
/// subscription ends, a close is requested or the peer goes away.
///
/// An event stream that ends while the connection is still open means the
/// manager dropped this subscriber for falling behind; the client is told to
/// reconnect, which gives it a fresh scrollback.
async fn forward_frames(
    mut sink: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut events: mpsc::Receiver<TerminalEvent>,
    mut replies: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut replies_open = true;

    loop {
        let frame = tokio::select! {
            event = events.recv() => match event {
                Some(event) => ServerMessage::from(event),
                None => {
                    let mut close = (close_code::AGAIN, "fell behind terminal output, reconnect");
                    while let Ok(reply) = replies.try_recv() {
                        match reply {
                            Outbound::Message(message) => {
                                if send_frame(&mut sink, &message).await.is_err() {
                                    return;
                                }
                            }
                            Outbound::Close { code, reason } => {
                                close = (code, reason);
                                break;
                            }
                        }
                    }
                    let (code, reason) = close;
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: Cow::Borrowed(reason),
                        })))
                        .await;
                    return;
                }
            },
            reply = replies.recv(), if replies_open => match reply {
                Some(Outbound::Message(message)) => message,
                Some(Outbound::Close { code, reason }) => {
                    // Flush whatever terminal output is already queued
                    while let Ok(event) = events.try_recv() {
                        if send_frame(&mut sink, &ServerMessage::from(event)).await.is_err() {
                            return;
                        }
                    }
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: Cow::Borrowed(reason),
                        })))
                        .await;
                    return;
                }
                None => {
                    replies_open = false;
                    continue;
                }
            },
        };

        if send_frame(&mut sink, &frame).await.is_err() {
            return;
        }
    }
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    frame: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => sink.send(WsMessage::Text(json)).await,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode frame");
            Ok(())
        }
    }
}

/// Apply one client request. Returns the reply for the requester, if any.
fn handle_client_message(
    state: &AppState,
    target: &Target,
    message: ClientMessage,
) -> Option<ServerMessage> {
    let manager = &state.manager;
    match message {
        ClientMessage::Input { data } => {
            if !manager.write(&target.session_id, &target.kind, data) {
                tracing::debug!(session_id = %target.session_id, kind = %target.kind, "input dropped, terminal not running");
            }
            None
        }
        ClientMessage::Resize { cols, rows } => {
            let (Ok(cols_u16), Ok(rows_u16)) = (u16::try_from(cols), u16::try_from(rows)) else {
                return Some(ServerMessage::session_error(
                    codes::VALIDATION_ERROR,
                    format!("invalid terminal size {}x{}: dimensions must be positive", cols, rows),
                ));
            };
            manager
                .resize(&target.session_id, &target.kind, cols_u16, rows_u16)
                .err()
                .map(|e| session_error(&e))
        }
        ClientMessage::Signal { signal } => manager
            .signal(&target.session_id, &target.kind, &signal)
            .err()
            .map(|e| session_error(&e)),
    }
}

fn session_error(error: &TerminalError) -> ServerMessage {
    let code = match error {
        TerminalError::NotFound(_) => codes::NOT_RUNNING,
        other => other.code(),
    };
    ServerMessage::session_error(code, error.to_string())
}
