use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::NodeConfig;
use crate::controller::Controller;
use crate::router::build_router;

#[derive(Parser, Debug)]
#[command(name = "relay-node", bin_name = "relay-node")]
#[command(about = "Node agent for managed proxy cores", version)]
#[command(arg_required_else_help = true)]
pub struct RelayNodeCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the node agent HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Bind address; overrides the NODE_HOST environment variable.
    #[arg(long, short = 'H')]
    host: Option<String>,

    /// Listen port; overrides the SERVICE_PORT environment variable.
    #[arg(long, short = 'p')]
    port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run() -> Result<(), CliError> {
    let cli = RelayNodeCli::parse();
    init_logging();
    match cli.command {
        Command::Server(args) => run_server(&args),
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

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let cfg = NodeConfig::from_env();

    let host = args
        .host
        .clone()
        .unwrap_or_else(|| cfg.node_host.to_string());
    let port = args.port.unwrap_or(cfg.service_port);
    let addr = format!("{host}:{port}");

    let controller = Controller::new(cfg);
    let router = build_router(controller.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "node agent listening");
        let shutdown_controller = Arc::clone(&controller);
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_controller.disconnect().await;
        })
        .await
        .map_err(|err| CliError::Server(err.to_string()))
    })
}
