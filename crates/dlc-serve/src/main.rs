//! dlc-serve
//!
//! Serves an inference handler on `/ping` and `/invocations` inside a
//! test container.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dlc_core::HarnessConfig;
use dlc_inference::{create_router, resnet, InferenceHandler, Resnet50Handler};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HandlerKind {
    Resnet50,
}

/// dlc-serve - inference handler server for DLC test containers
#[derive(Parser, Debug)]
#[command(name = "dlc-serve")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind the server
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    /// Port for the invocation server
    #[arg(long, default_value_t = 8080, env = "SAGEMAKER_BIND_TO_PORT")]
    port: u16,

    /// Handler to serve
    #[arg(long, value_enum, default_value = "resnet50")]
    handler: HandlerKind,

    /// TensorFlow Serving REST predict endpoint
    #[arg(
        long,
        default_value = "http://localhost:8501/v1/models/resnet50:predict",
        env = "TFS_REST_URI"
    )]
    rest_uri: String,

    /// TensorFlow Serving gRPC port, used on Neuron hosts
    #[arg(long, default_value_t = 8500, env = "TFS_GRPC_PORT")]
    grpc_port: u16,

    /// Log level, overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Harness config file
    #[arg(long, env = "DLC_CONFIG")]
    config: Option<PathBuf>,
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = FmtSubscriber::builder().with_env_filter(filter).with_target(false);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
    .context("Failed to set subscriber")
}

fn build_handler(args: &Args) -> Result<Arc<dyn InferenceHandler>> {
    match args.handler {
        HandlerKind::Resnet50 => {
            let neuron_host = resnet::is_neuron_host(|key| std::env::var(key).ok());
            let handler = Resnet50Handler::new(args.rest_uri.clone(), args.grpc_port, neuron_host)?;
            Ok(Arc::new(handler))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = HarnessConfig::load(args.config.as_deref())?;
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, config.logging.format == "json")?;

    info!("Starting dlc-serve v{}", env!("CARGO_PKG_VERSION"));

    let handler = build_handler(&args)?;
    info!(handler = handler.name(), "Handler loaded");
    let router = create_router(handler);

    let addr: SocketAddr = format!("{}:{}", args.address, args.port)
        .parse()
        .context("Invalid address")?;
    info!("Invocation server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router).await.context("Server error")?;
    Ok(())
}
