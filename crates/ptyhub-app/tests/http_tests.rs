mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use pretty_assertions::assert_eq;
use ptyhub::web::control_router;
use ptyhub_terminal::TerminalEvent;
use ptyhub_types::TerminalKind;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{printenv_kind, TestFixture};

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_process_counts() {
    let fixture = TestFixture::new();
    let app = control_router(fixture.state.clone());

    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "processes": 0, "running": 0}));
}

#[tokio::test]
async fn start_status_stop_round_trip() {
    let fixture = TestFixture::new();
    let app = control_router(fixture.state.clone());

    let (status, body) = call(
        &app,
        Method::POST,
        "/sessions/demo/shell/start",
        Some(json!({"workingDirectory": "project", "config": {"cols": 100, "rows": 30}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["success"], true);
    let pid = body["pid"].as_u64().unwrap();

    let (status, body) = call(&app, Method::GET, "/sessions/demo/shell/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);
    assert_eq!(body["status"], "running");
    assert_eq!(body["pid"].as_u64(), Some(pid));
    assert_eq!(body["cols"], 100);

    // Non-exclusive kinds hand back the running instance
    let (status, body) = call(&app, Method::POST, "/sessions/demo/shell/start", Some(json!({"workingDirectory": "."}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pid"].as_u64(), Some(pid));
    assert_eq!(body["reused"], true);

    let (status, body) = call(&app, Method::POST, "/sessions/demo/shell/stop", Some(json!({"force": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["outcome"], "stopped");

    let (_, body) = call(&app, Method::GET, "/sessions/demo/shell/status", None).await;
    assert_eq!(body["running"], false);
    assert_eq!(body["status"], "exited");

    // Stopping again is a no-op, and an empty body is accepted
    let (status, body) = call(&app, Method::POST, "/sessions/demo/shell/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already_exited");
}

#[tokio::test]
async fn exclusive_kind_conflicts_while_running() {
    let fixture = TestFixture::new();
    let app = control_router(fixture.state.clone());

    let start = || call(&app, Method::POST, "/sessions/demo/assistant/start", Some(json!({"workingDirectory": "."})));
    let (status, _) = start().await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = start().await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "ALREADY_RUNNING");

    fixture.state.manager.shutdown_all().await;
}

#[tokio::test]
async fn invalid_requests_carry_stable_codes() {
    let fixture = TestFixture::new();
    let app = control_router(fixture.state.clone());

    let cases = [
        ("/sessions/demo/unknown/start", json!({"workingDirectory": "."})),
        ("/sessions/demo/Bad%20Kind/start", json!({"workingDirectory": "."})),
        ("/sessions/demo/shell/start", json!({"workingDirectory": "../.."})),
        ("/sessions/demo/shell/start", json!({"workingDirectory": "missing"})),
        ("/sessions/demo/shell/start", json!({"workingDirectory": ".", "config": {"cols": 0}})),
        ("/sessions/demo/shell/start", json!({"workingDirectory": 42})),
    ];
    for (uri, body) in cases {
        let (status, response) = call(&app, Method::POST, uri, Some(body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{} {}", uri, body);
        assert_eq!(response["error"], "VALIDATION_ERROR");
        assert!(response["message"].as_str().is_some());
    }

    // Unknown sessions have no working directory to fall back to
    let (status, response) = call(&app, Method::POST, "/sessions/nobody/shell/start", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "VALIDATION_ERROR");

    assert_eq!(fixture.state.manager.process_count(), 0);
}

#[tokio::test]
async fn working_directory_defaults_to_the_session() {
    let fixture = TestFixture::new();
    let app = control_router(fixture.state.clone());

    let (status, body) = call(&app, Method::POST, "/sessions/demo/shell/start", None).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert!(fixture.state.manager.is_running("demo", &TerminalKind::shell()));

    fixture.state.manager.shutdown_all().await;
}

#[tokio::test]
async fn legacy_routes_act_on_the_primary_kind() {
    let fixture = TestFixture::new();
    let app = control_router(fixture.state.clone());

    let (status, body) = call(&app, Method::POST, "/sessions/demo/start", Some(json!({"workingDirectory": "."}))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert!(fixture.state.manager.is_running("demo", &TerminalKind::assistant()));

    let (status, body) = call(&app, Method::GET, "/sessions/demo/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["terminal"], "assistant");
    assert_eq!(body["running"], true);

    let (status, _) = call(&app, Method::POST, "/sessions/demo/stop", Some(json!({"force": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!fixture.state.manager.is_running("demo", &TerminalKind::assistant()));

    let (status, body) = call(&app, Method::POST, "/sessions/demo/restart", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
}

#[tokio::test]
async fn status_of_unknown_terminal_is_not_running() {
    let fixture = TestFixture::new();
    let app = control_router(fixture.state.clone());

    let (status, body) = call(&app, Method::GET, "/sessions/demo/alternate/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "sessionId": "demo",
            "terminal": "alternate",
            "running": false,
            "status": null,
            "pid": null,
        })
    );
}

#[tokio::test]
async fn list_and_remove_terminals() {
    let fixture = TestFixture::new();
    let app = control_router(fixture.state.clone());

    for kind in ["shell", "alternate"] {
        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/sessions/demo/{}/start", kind),
            Some(json!({"workingDirectory": "."})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = call(&app, Method::GET, "/sessions/demo/terminals", None).await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = body["terminals"]
        .as_array()
        .unwrap()
        .iter()
        .map(|terminal| terminal["terminal"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["alternate", "shell"]);

    let (status, body) = call(&app, Method::DELETE, "/sessions/demo/shell", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true, "removed": true}));
    assert!(fixture.state.manager.get_status("demo", &TerminalKind::shell()).is_none());

    let (_, body) = call(&app, Method::DELETE, "/sessions/demo/shell", None).await;
    assert_eq!(body["removed"], false);

    fixture.state.manager.shutdown_all().await;
}

#[tokio::test]
async fn initiator_credentials_reach_the_process() {
    let fixture = TestFixture::new();
    let app = control_router(fixture.state.clone());
    let kind = printenv_kind();

    let (status, body) = call(
        &app,
        Method::POST,
        "/sessions/demo/printenv/start",
        Some(json!({"workingDirectory": ".", "initiatorId": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (tx, mut rx) = fixture.state.manager.event_channel();
    let _subscription = fixture.state.manager.subscribe("demo", &kind, tx).unwrap();

    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !seen.contains("secret=from-credentials") {
        match tokio::time::timeout_at(deadline, rx.recv()).await.unwrap().unwrap() {
            TerminalEvent::Scrollback(chunks) => seen.extend(chunks),
            TerminalEvent::Output { data, .. } => seen.push_str(&data),
            TerminalEvent::Status(_) => {}
        }
    }

    let status = fixture.state.manager.get_status("demo", &kind).unwrap();
    assert_eq!(status.started_by.as_deref(), Some("alice"));

    fixture.state.manager.shutdown_all().await;
}
