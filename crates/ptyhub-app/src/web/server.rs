use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::web::{routes, ws};

/// Create the streaming router
pub fn streaming_router(state: routes::AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

fn with_layers(router: Router) -> Router {
    // CORS is open; access control happens at the handshake and upstream
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router.layer(cors).layer(TraceLayer::new_for_http())
}

/// The streaming and control listeners, bound but not yet serving
pub struct Servers {
    state: routes::AppState,
    ws_listener: TcpListener,
    http_listener: TcpListener,
}

impl Servers {
    pub async fn bind(
        state: routes::AppState,
        ws_addr: SocketAddr,
        http_addr: SocketAddr,
    ) -> Result<Self> {
        let ws_listener = TcpListener::bind(ws_addr)
            .await
            .with_context(|| format!("Failed to bind streaming listener on {}", ws_addr))?;
        let http_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind control listener on {}", http_addr))?;

        Ok(Self {
            state,
            ws_listener,
            http_listener,
        })
    }

    pub fn ws_addr(&self) -> Result<SocketAddr> {
        Ok(self.ws_listener.local_addr()?)
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http_listener.local_addr()?)
    }

    /// Serve both listeners until the state's shutdown token is cancelled,
    /// then stop every managed process
    pub async fn serve(self) -> Result<()> {
        let ws_addr = self.ws_addr()?;
        let http_addr = self.http_addr()?;
        tracing::info!(%ws_addr, "streaming endpoint ws://{}/ws", ws_addr);
        tracing::info!(%http_addr, "control API http://{}/sessions", http_addr);

        let shutdown = self.state.shutdown.clone();
        let ws_shutdown = shutdown.clone();
        let http_shutdown = shutdown.clone();

        let ws_app = with_layers(streaming_router(self.state.clone()));
        let http_app = with_layers(routes::control_router(self.state.clone()));

        let ws_server = axum::serve(self.ws_listener, ws_app)
            .with_graceful_shutdown(async move { ws_shutdown.cancelled().await });
        let http_server = axum::serve(self.http_listener, http_app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await });

        // One listener failing takes the other down with it
        let (ws_result, http_result) = tokio::join!(
            async {
                let result = ws_server.await;
                shutdown.cancel();
                result
            },
            async {
                let result = http_server.await;
                shutdown.cancel();
                result
            },
        );

        self.state.manager.shutdown_all().await;
        tracing::info!("servers stopped");

        ws_result.context("Streaming server failed")?;
        http_result.context("Control server failed")?;
        Ok(())
    }
}
