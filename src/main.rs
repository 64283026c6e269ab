use anyhow::Context;
use clap::Parser;
use rustyrag::service::PipelineService;
use rustyrag::{api, config, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Document ingestion and retrieval pipeline server.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Port to listen on; overrides `SERVER_PORT`.
    #[arg(long)]
    port: Option<u16>,
    /// Load environment variables from this file before reading configuration.
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Default log level when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(path) = &cli.env_file {
        dotenvy::from_path(path)
            .with_context(|| format!("failed to load env file {}", path.display()))?;
    }
    logging::init_tracing(cli.log_level.as_deref());
    let config = config::init_config().context("invalid configuration")?;

    let service = PipelineService::from_config(config)
        .await
        .context("failed to initialize pipeline service")?;
    let app = api::create_router(Arc::new(service));

    let (listener, port) = bind_listener(cli.port.or(config.server_port))
        .await
        .context("failed to bind listener")?;
    tracing::info!(port, collection = %config.vector_collection, "Listening on http://0.0.0.0:{port}");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn bind_listener(port: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
