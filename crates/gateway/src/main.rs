mod config;
mod error;
mod routes;
mod state;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::GatewayConfig;
use state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the gateway to
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
    /// Path to the TOML config file (provider endpoints, model mappings, signature cache)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Optional bearer token required on every request (falls back to GATEWAY_AUTH_KEY)
    #[arg(long, env = "GATEWAY_AUTH_KEY")]
    auth_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gateway=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => GatewayConfig::from_path(path)?,
        None => GatewayConfig::default(),
    };

    info!(
        addr = %args.addr,
        config = ?args.config,
        auth = %args.auth_key.as_ref().map(|_| "enabled").unwrap_or("disabled"),
        "starting gateway"
    );

    let state = AppState::new(&config, args.auth_key);
    let app = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
