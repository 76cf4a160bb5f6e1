use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use anchorage::{cli::Cli, server::Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    info!("starting anchorage registry v{}", env!("CARGO_PKG_VERSION"));
    info!("config file: {:?}", cli.config);

    let server = Server::new(cli.config).await?;
    server.run().await?;

    info!("anchorage registry stopped");
    Ok(())
}
