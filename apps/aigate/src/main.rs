use std::error::Error;

use clap::Parser;
use tracing::info;

mod cli;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("aigate failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Cli::parse().into_patch().into_config()?;
    info!(
        event = "config_loaded",
        host = %config.host,
        port = config.port,
        routes = %config.routes_path.display(),
        catalog = %config.catalog_path.display(),
        proxy = %config.proxy.as_deref().unwrap_or(""),
        max_body_bytes = config.max_body_bytes,
    );

    let core = aigate_core::bootstrap(&config)?;
    let app = core.router();

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(event = "listening", addr = %addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!(event = "shutdown");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(event = "signal_error", error = %err);
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
