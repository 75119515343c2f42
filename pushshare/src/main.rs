mod handler;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info, warn};

use pushshare_cluster::PubSub;
use pushshare_core::{logging, metrics, Config};

use handler::LoggingHandler;

#[derive(Parser, Debug)]
#[command(version, about = "Share one server-push connection between processes on this host", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML); environment variables override it
    #[arg(short, long, env = "PUSHSHARE_CONFIG")]
    config: Option<String>,

    /// Base URL of the push server, overriding the configuration
    #[arg(long)]
    server_url: Option<String>,

    /// Log a status line every N seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        config.server.base_url = server_url;
    }

    // 2. Validate (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(pushshare_core::Error::InvalidConfig(errors).into());
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(
        server = %config.server.base_url,
        bus = ?config.bus.kind,
        "PushShare starting..."
    );

    // 4. Join the group and connect
    let pubsub = PubSub::from_config(&config, LoggingHandler).await?;
    pubsub.open()?;
    info!(process_id = %pubsub.process_id(), "Joined local group");

    // 5. Run until a shutdown signal arrives
    let mut status_timer = (args.status_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.status_interval)));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = async {
                match status_timer.as_mut() {
                    Some(timer) => timer.tick().await,
                    None => std::future::pending().await,
                }
            } => {
                match serde_json::to_string(&pubsub.status()) {
                    Ok(status) => info!(status = %status, "Status"),
                    Err(e) => warn!(error = %e, "Failed to serialize status"),
                }
            }
        }
    }

    // 6. Leave gracefully
    if let Err(e) = pubsub.close().await {
        error!(error = %e, "Failed to close pub/sub cleanly");
    }
    match metrics::gather() {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to gather metrics"),
    }
    info!("PushShare stopped");

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
