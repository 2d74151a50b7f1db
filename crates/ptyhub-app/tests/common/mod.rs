#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use ptyhub::{
    AppState, KindRegistry, KindSpec, ManagerConfig, PtyManager, SessionEntry, Servers,
    StaticCredentials, StaticSessions,
};
use ptyhub_types::TerminalKind;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Kind whose process prints one credential variable and then waits
pub fn printenv_kind() -> TerminalKind {
    TerminalKind::new("printenv").unwrap()
}

/// State over real ptys: `cat` stands in for every assistant CLI
pub struct TestFixture {
    pub root: TempDir,
    pub state: AppState,
}

impl TestFixture {
    pub fn new() -> Self {
        let root = TempDir::new().expect("Failed to create temp directory");
        std::fs::create_dir(root.path().join("project")).expect("Failed to create project dir");

        let mut config = ManagerConfig::new(root.path());
        config.stop_grace = Duration::from_millis(500);
        config.kill_timeout = Duration::from_secs(1);
        config.shutdown_timeout = Duration::from_secs(2);

        let kinds = KindRegistry::builtin()
            .with_kind(
                TerminalKind::assistant(),
                KindSpec::new("cat").exclusive().primary(),
            )
            .with_kind(TerminalKind::alternate(), KindSpec::new("cat"))
            .with_kind(TerminalKind::shell(), KindSpec::new("cat"))
            .with_kind(
                printenv_kind(),
                KindSpec::new("/bin/sh")
                    .with_args(["-c", "echo secret=$PTYHUB_TEST_SECRET; exec cat"]),
            );
        let manager = PtyManager::new(config, kinds).expect("Failed to create manager");

        let sessions = StaticSessions::new([
            SessionEntry {
                id: "demo".to_string(),
                working_directory: PathBuf::from("project"),
                owner: Some("alice".to_string()),
                public: false,
                share_token: Some("s3cret".to_string()),
            },
            SessionEntry {
                id: "open".to_string(),
                working_directory: PathBuf::from("."),
                owner: None,
                public: true,
                share_token: None,
            },
        ]);

        let mut users = BTreeMap::new();
        users.insert(
            "alice".to_string(),
            BTreeMap::from([(
                "PTYHUB_TEST_SECRET".to_string(),
                "from-credentials".to_string(),
            )]),
        );

        let state = AppState {
            manager: Arc::new(manager),
            sessions: Arc::new(sessions),
            credentials: Arc::new(StaticCredentials::new(users)),
            shutdown: CancellationToken::new(),
        };

        Self { root, state }
    }
}

/// Both listeners on ephemeral ports
pub struct TestServer {
    pub fixture: TestFixture,
    pub ws_addr: SocketAddr,
    pub http_addr: SocketAddr,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let fixture = TestFixture::new();
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let servers = Servers::bind(fixture.state.clone(), any, any)
            .await
            .expect("Failed to bind listeners");
        let ws_addr = servers.ws_addr().unwrap();
        let http_addr = servers.http_addr().unwrap();
        let task = tokio::spawn(servers.serve());

        Self {
            fixture,
            ws_addr,
            http_addr,
            task,
        }
    }

    pub fn manager(&self) -> &Arc<PtyManager> {
        &self.fixture.state.manager
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    pub async fn connect(&self, query: &str) -> WsClient {
        let url = format!("ws://{}/ws?{}", self.ws_addr, query);
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("WebSocket handshake failed");
        ws
    }

    /// Start a terminal through the control API
    pub async fn start_terminal(&self, session: &str, kind: &str) -> Value {
        let response = reqwest::Client::new()
            .post(self.http_url(&format!("/sessions/{}/{}/start", session, kind)))
            .json(&serde_json::json!({ "workingDirectory": "." }))
            .send()
            .await
            .expect("start request failed");
        assert!(response.status().is_success(), "start returned {}", response.status());
        response.json().await.expect("start body")
    }

    pub async fn shutdown(self) {
        self.fixture.state.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("servers did not stop");
        result.expect("server task panicked").expect("server failed");
    }
}

/// Next frame of any kind
pub async fn next_message(ws: &mut WsClient) -> Message {
    tokio::time::timeout(FRAME_TIMEOUT, ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection ended")
        .expect("connection error")
}

/// Next JSON text frame
pub async fn next_frame(ws: &mut WsClient) -> Value {
    loop {
        match next_message(ws).await {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("frame is JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

/// Skip frames until one of `frame_type` satisfies `matches`
pub async fn frame_where(
    ws: &mut WsClient,
    frame_type: &str,
    matches: impl Fn(&Value) -> bool,
) -> Value {
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == frame_type && matches(&frame["payload"]) {
            return frame;
        }
    }
}

/// Collect output frames until they contain `needle`
pub async fn output_containing(ws: &mut WsClient, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        let frame = next_frame(ws).await;
        match frame["type"].as_str() {
            Some("terminal:output") => seen.push_str(frame["payload"]["data"].as_str().unwrap_or_default()),
            Some("terminal:scrollback") => {
                for chunk in frame["payload"]["data"].as_array().into_iter().flatten() {
                    seen.push_str(chunk.as_str().unwrap_or_default());
                }
            }
            _ => {}
        }
    }
    seen
}

/// Expect the connection to be closed with `code`
pub async fn expect_close(ws: &mut WsClient, code: u16) {
    loop {
        match next_message(ws).await {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), code);
                return;
            }
            Message::Close(None) => panic!("close frame without a code"),
            _ => continue,
        }
    }
}
