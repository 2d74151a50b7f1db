use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use ptyhub_terminal::PtyManager;

use crate::cli::Cli;
use crate::config::FileConfig;
use crate::resolver::{
    CredentialResolver, NoCredentials, OpenSessions, SessionResolver, StaticCredentials,
    StaticSessions,
};
use crate::web::{AppState, Servers};

/// Assemble the manager and collaborators described by the CLI and the
/// optional configuration file
pub fn build_state(cli: &Cli, shutdown: CancellationToken) -> Result<AppState> {
    let file = FileConfig::load_optional(cli.config.as_deref())?;
    let kinds = file.kind_registry()?;
    let manager = PtyManager::new(cli.manager_config(), kinds)
        .with_context(|| format!("Failed to set up root {}", cli.root.display()))?;

    let sessions: Arc<dyn SessionResolver> = if file.sessions.is_empty() {
        tracing::warn!("no sessions configured, every session id is accepted as public");
        Arc::new(OpenSessions)
    } else {
        let sessions = StaticSessions::new(file.sessions.clone());
        tracing::info!(sessions = sessions.len(), "loaded sessions");
        Arc::new(sessions)
    };

    let credentials: Arc<dyn CredentialResolver> = if file.credentials.is_empty() {
        Arc::new(NoCredentials)
    } else {
        Arc::new(StaticCredentials::new(file.credentials.clone()))
    };

    tracing::info!(
        root = %manager.root().display(),
        kinds = ?manager.kinds().kinds().map(|kind| kind.as_str()).collect::<Vec<_>>(),
        primary = %manager.kinds().primary(),
        "process manager configured"
    );

    Ok(AppState {
        manager: Arc::new(manager),
        sessions,
        credentials,
        shutdown,
    })
}

/// Run both servers until Ctrl-C
pub async fn run(cli: Cli) -> Result<()> {
    let shutdown = CancellationToken::new();
    let state = build_state(&cli, shutdown.clone())?;

    let servers = Servers::bind(
        state,
        SocketAddr::new(cli.bind, cli.ws_port),
        SocketAddr::new(cli.bind, cli.http_port),
    )
    .await?;

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl-C"),
        }
        shutdown.cancel();
    });

    servers.serve().await
}
