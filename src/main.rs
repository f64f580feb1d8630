//! WebSocket relay server
//!
//! Every client joins one lobby. Messages keyed `echo:` go back to the
//! sender only; everything else is relayed to the whole lobby, and joins
//! and leaves are announced.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ws_engine::conn::{connection_hook, message_callback};
use ws_engine::{MessageHandler, Namespace, Server, ServerConfig};

/// WebSocket relay server
#[derive(Parser, Debug)]
#[command(name = "ws-engine")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("ws-engine relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match args.config {
        Some(ref path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let lobby = Namespace::new("lobby");

    let handler = MessageHandler::new();
    handler
        .add_handler("echo", |conn, body| async move {
            if let Err(e) = conn.write_message(&body).await {
                warn!("Echo to {} failed: {}", conn.id(), e);
            }
        })
        .await;

    let server = Server::listen(config)
        .await?
        .with_handler(Arc::new(handler))
        .on_open(connection_hook({
            let lobby = Arc::clone(&lobby);
            move |conn| {
                let lobby = Arc::clone(&lobby);
                async move {
                    lobby.add_client(&conn).await;
                    lobby.write_text(&format!("{} joined", conn.id())).await;
                }
            }
        }))
        .on_close(connection_hook({
            let lobby = Arc::clone(&lobby);
            move |conn| {
                let lobby = Arc::clone(&lobby);
                async move {
                    lobby.remove_client(&conn).await;
                    lobby.write_text(&format!("{} left", conn.id())).await;
                }
            }
        }));
    let server = Arc::new(server);

    let relay = message_callback({
        let lobby = Arc::clone(&lobby);
        move |conn, message| {
            let lobby = Arc::clone(&lobby);
            async move {
                let recipients = lobby.write(&message).await;
                info!(
                    "Relayed {} bytes from {} to {} clients",
                    message.len(),
                    conn.id(),
                    recipients
                );
            }
        }
    });

    let server_handle = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        if let Err(e) = server_handle.close().await {
            warn!("Error during shutdown: {}", e);
        }
    });

    server.serve(Some(relay)).await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
