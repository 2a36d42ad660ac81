//! Pulsar Signaling Service - Main Entry Point
//!
//! Starts the WebSocket signaling relay together with its health and
//! metrics endpoints and the reconnect sweeper.

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pulsar_signaling::*;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // 2. Initialize logging and tracing
    logging::init(&config).context("Failed to initialize logging")?;

    // 3. Banner and sanitized configuration
    logging::print_banner(&config);
    logging::log_config(&config);

    info!("🚀 Starting all services...");

    // 4. Store
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            info!("💾 Connecting to PostgreSQL store...");
            Arc::new(
                PostgresStore::connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL store")?,
            )
        }
        None => Arc::new(MemoryStore::new()),
    };
    logging::log_status("💾", &format!("Store ({})", store.name()), "READY", true);

    // 5. Collaborators
    let credentials = credentials::from_config(&config);
    logging::log_status("🔑", "TURN Credentials", "READY", true);

    // 6. Signaling handler and sweeper
    let cancel = CancellationToken::new();
    let deps = Dependencies {
        store: store.clone(),
        credentials,
        events: Arc::new(LogEventSink),
    };
    let (tracker, signaling) = handler(cancel.clone(), deps, &config);
    logging::log_status("🧹", "Disconnect Sweeper", "RUNNING", true);

    // 7. HTTP server
    info!("🌐 Starting HTTP server on {}...", config.http_bind);
    let http_cancel = cancel.clone();
    let http_config = config.clone();
    let mut http_handle = tokio::spawn(async move {
        http_server::run_server(&http_config, store, signaling, http_cancel).await
    });
    logging::log_status("🌐", "HTTP Server", "LISTENING", true);

    println!("\n{}", "✅ All services started successfully!".bright_green().bold());
    println!("{}\n", "━".repeat(60).bright_black());

    // 8. Wait for a shutdown signal, or the server dying on its own
    let coordinator = ShutdownCoordinator::new(cancel.clone(), tracker);
    let early_exit = tokio::select! {
        _ = coordinator.wait_for_signal() => None,
        result = &mut http_handle => Some(result),
    };

    println!("{}", "🛑 Shutting down services...".bright_yellow().bold());
    println!("{}", "━".repeat(60).bright_black());

    // 9. Drain connections; disconnect bookkeeping runs for each
    let drained = coordinator.shutdown(config.shutdown_timeout()).await;
    match &drained {
        Ok(()) => logging::log_status("🔌", "Connections", "DRAINED", true),
        Err(_) => logging::log_status("🔌", "Connections", "TIMED OUT", false),
    }

    let server_result = match early_exit {
        Some(result) => result,
        None => http_handle.await,
    };
    match server_result.context("HTTP server task panicked")? {
        Ok(()) => logging::log_status("🌐", "HTTP Server", "STOPPED", true),
        Err(e) => {
            logging::log_status("🌐", "HTTP Server", "FAILED", false);
            return Err(e.context("HTTP server failed"));
        }
    }

    println!("\n{}", "👋 Pulsar Signaling stopped cleanly".bright_green().bold());
    println!("{}\n", "━".repeat(60).bright_black());

    Ok(())
}
