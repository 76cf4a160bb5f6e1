use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "anchorage")]
#[command(about = "A multi-tenant OCI/Docker container image registry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,
}
