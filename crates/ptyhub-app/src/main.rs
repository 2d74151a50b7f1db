use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ptyhub::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ptyhub=info,ptyhub_terminal=info".into()),
        )
        .init();

    let cli = Cli::parse();
    ptyhub::run(cli).await
}
