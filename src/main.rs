use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crossword_sync::config::ServerConfig;
use crossword_sync::metrics::{self, Metrics};
use crossword_sync::net::{SyncHub, SyncServer};
use crossword_sync::store::{EventLog, InMemoryEventLog};
use crossword_sync::util::clock::SystemTimeSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Crossword Sync Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: {}:{}, max_connections={}, submit_queue={}",
        config.bind_address, config.port, config.max_connections, config.submit_queue
    );

    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let time = Arc::new(SystemTimeSource);
    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new(time.clone()));
    let hub = SyncHub::start(log.clone(), config.submit_queue, metrics.clone());

    let server = SyncServer::bind(config.clone(), hub.clone(), metrics.clone()).await?;

    #[cfg(feature = "battle")]
    let server = {
        use crossword_sync::battle::{BattleService, BattleStore};
        let store = Arc::new(BattleStore::new(time.clone(), metrics.clone()));
        server.with_battle(Arc::new(BattleService::new(store, log.clone())))
    };

    info!("Server ready on {}", server.local_addr()?);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    info!(
        "Server stopped ({} events appended, {} entities still subscribed)",
        metrics.events_appended.load(std::sync::atomic::Ordering::Relaxed),
        metrics.entities_active.load(std::sync::atomic::Ordering::Relaxed)
    );

    Ok(())
}
