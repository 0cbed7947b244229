//! Command-line entry point for the gateway server.

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use flint_error::GatewayError;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::engine::Gateway;
use crate::router::{build_router_with_state, AppState, AuthConfig};
use crate::settings::GatewayOptions;

const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Parser, Debug)]
#[command(name = "flint", bin_name = "flint")]
#[command(about = "Self-hosted gateway bridging messaging channels to coding agents")]
#[command(version, arg_required_else_help = true)]
pub struct FlintCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway HTTP server.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    /// Defaults to the PORT env var, then 8788.
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Bearer token required on /v1 routes.
    #[arg(long, short = 't')]
    token: Option<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub fn run_flint() -> Result<(), CliError> {
    let cli = FlintCli::parse();
    init_logging();
    match cli.command {
        Command::Serve(args) => run_serve(args),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_serve(args: ServeArgs) -> Result<(), CliError> {
    let options = GatewayOptions::from_env()?;
    let port = args.port.unwrap_or(options.port);
    let cors = build_cors_layer(&args)?;

    let auth = match args.token.clone() {
        Some(token) => AuthConfig::with_token(token),
        None => AuthConfig::disabled(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let gateway = Gateway::start(options, Vec::new()).await?;
        let state = AppState {
            gateway: gateway.clone(),
            auth,
        };
        let (router, _state) = build_router_with_state(Arc::new(state));
        let router = router.layer(cors);

        let addr = format!("{}:{}", args.host, port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "gateway listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal(gateway))
            .await?;
        Ok(())
    })
}

/// Resolves on SIGINT or SIGTERM, draining the listener and closing every
/// runtime before the process exits.
async fn shutdown_signal(gateway: Arc<Gateway>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down");
    gateway.shutdown().await;
}

fn build_cors_layer(args: &ServeArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &args.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if args.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &args.cors_allow_method {
            methods.push(
                method
                    .parse()
                    .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?,
            );
        }
        cors = cors.allow_methods(methods);
    }

    if args.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &args.cors_allow_header {
            headers.push(
                header
                    .parse()
                    .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?,
            );
        }
        cors = cors.allow_headers(headers);
    }

    Ok(cors)
}
