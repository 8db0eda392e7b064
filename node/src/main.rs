//! Node entry point: configuration, logging, lifecycle.

mod block_factory;
mod chain;
mod chain_service;
mod config;
mod debugger;
mod metrics;
mod pb;
mod raft;
mod raft_client;
mod raft_service;
mod server;

use clap::Parser;
use tokio::signal;

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/config.toml"))]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    config::RuntimeConfig::from_toml(&args.config).expect("config is missing");

    {
        server::instance().lock().await.start().await;
    }

    // the raft server stopping on its own (e.g. removed from the cluster)
    // also terminates the process
    let mut raft_stopped = { server::instance().lock().await.raft_server().stopped() };
    tokio::select! {
        _ = shutdown_signal() => {},
        _ = raft_stopped.changed() => {
            log::info!("raft server stopped, shutting down");
        }
    }

    {
        server::instance().lock().await.stop();
    }
    Ok(())
}
