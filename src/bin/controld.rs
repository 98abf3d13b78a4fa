use clap::Parser;
use dotenvy::dotenv;
use tracing::info;

use sentinel_core::platform::{Platform, PlatformConfig};

#[derive(Parser)]
#[command(author, version, about = "Sentinel monitoring control plane", long_about = None)]
struct Args {
    /// Configuration file (TOML); falls back to configs/sentinel.toml
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();
    let config = PlatformConfig::load_from_path(args.config.as_deref())?;

    let runtime = Platform::new(config).start().await?;
    info!("controld running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    runtime.shutdown().await?;
    Ok(())
}
