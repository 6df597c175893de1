use std::sync::Arc;

use axum::http::HeaderValue;
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use atelier_error::AtelierError;

use crate::permission;
use crate::registry::ProjectRegistry;
use crate::router::{build_router_with_state, shutdown_instances, AppState};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4096;

#[derive(Parser, Debug)]
#[command(name = "atelier", bin_name = "atelier")]
#[command(about = "Multi-project AI coding assistant server", version)]
#[command(arg_required_else_help = true)]
pub struct AtelierCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the atelier HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    /// Grant every tool permission request without asking, for all projects.
    #[arg(long)]
    yolo: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Core(#[from] AtelierError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_atelier() -> Result<(), CliError> {
    let cli = AtelierCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    match cli.command {
        Command::Server(args) => run_server(&args),
    }
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    if server.yolo {
        tracing::warn!("--yolo: every tool permission request will be auto-granted");
    }
    permission::force_skip_requests(server.yolo);

    let registry = Arc::new(ProjectRegistry::open_default()?);
    let state = Arc::new(AppState::new(registry));
    let (mut router, state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_instances(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    if server.cors_allow_origin.is_empty() {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }

    let mut origins = Vec::with_capacity(server.cors_allow_origin.len());
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse::<HeaderValue>()
            .map_err(|_| CliError::Server(format!("invalid cors origin: {origin}")))?;
        origins.push(value);
    }
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any))
}
