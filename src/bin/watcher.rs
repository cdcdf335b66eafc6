use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use transfer_watch::bootstrap::{run_discovery, seed_registry};
use transfer_watch::config::Config;
use transfer_watch::detection::{
    DetectionDispatcher, HttpRiskAnalyzer, LogOnlyAnalyzer, RiskAnalyzer,
};
use transfer_watch::pipeline::TransferPipeline;
use transfer_watch::recorder::TransferRecorder;
use transfer_watch::registry::{ListenerRegistry, RetryPolicy};
use transfer_watch::repository::Database;
use transfer_watch::source::AlloyEventSource;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting transfer watcher");

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("Websocket RPC: {}", config.ws_rpc_url);

    let db = Database::new(&config.database_url).context("Failed to open database")?;
    info!("Database initialized");

    let source = AlloyEventSource::connect(&config.ws_rpc_url, config.subscribe_timeout)
        .await
        .context("Failed to connect to websocket provider")?;

    let analyzer: Arc<dyn RiskAnalyzer> = match &config.risk_analyzer_url {
        Some(url) => {
            info!("Risk analyzer endpoint: {}", url);
            Arc::new(HttpRiskAnalyzer::new(url.clone()))
        }
        None => {
            info!("RISK_ANALYZER_URL not set, detections are only logged");
            Arc::new(LogOnlyAnalyzer)
        }
    };

    let pipeline = TransferPipeline::new(
        TransferRecorder::new(Arc::new(db.clone())),
        DetectionDispatcher::new(Arc::new(db.clone()), analyzer, config.detection_timeout),
    );
    let retry = RetryPolicy {
        max_retries: config.subscribe_max_retries,
        ..RetryPolicy::default()
    };
    let registry = Arc::new(ListenerRegistry::new(Arc::new(source), pipeline, retry));

    let activated = seed_registry(&db, &registry)
        .await
        .context("Failed to load monitored contracts")?;
    info!("Watching {} contracts", activated);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let discovery = tokio::spawn(run_discovery(
        Arc::new(db.clone()),
        registry.clone(),
        config.discovery_interval,
        shutdown_rx,
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = discovery.await {
        error!("Discovery task error: {}", e);
    }
    registry.teardown_all().await;

    Ok(())
}
