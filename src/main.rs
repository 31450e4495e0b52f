use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use gatehouse::{GatewayConfig, Runtime, Server};
use tracing_subscriber::EnvFilter;

/// Authenticating edge gateway.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "GATEWAY_CONFIG", default_value = "gateway.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gatehouse=info")),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let runtime = Runtime::start(&config)
        .await
        .context("starting gateway")?;

    let server = Server::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    server
        .serve(runtime.gateway(), config.shutdown_grace())
        .await
        .context("serving")?;

    runtime.shutdown().await;
    Ok(())
}
