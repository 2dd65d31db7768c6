use crowdsale_monitor::data_sync::{MarketDataAggregator, MonitorConfig, RpcChainClient, SubscriptionManager};
use crowdsale_monitor::logic::{ReconciliationEngine, TracingReportSink};
use eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("note: no .env loaded: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_line_number(true)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            MonitorConfig::from_file(&path).await?
        }
        None => MonitorConfig::from_env()?,
    };

    info!("WebSocket RPC: {}", config.rpc_wss_url);
    info!("HTTP RPC: {}", config.rpc_http_url);
    info!("Sale contract: {}", config.sale_address);
    info!("Market venues: {:?}", config.providers);

    let chain = Arc::new(RpcChainClient::new(config.rpc_http_url.clone(), config.http_timeout())?);
    let market = MarketDataAggregator::for_venues(&config.providers, config.http_timeout())?;
    let engine = ReconciliationEngine::new(&config, chain, market, Box::new(TracingReportSink))?;

    let subscriptions = SubscriptionManager::new(
        config.rpc_wss_url.clone(),
        config.ws_connection_timeout(),
        config.max_reconnect_attempts,
        config.reconnect_delay(),
        config.channel_buffer_size,
    )
    .subscribe();

    let (engine_shutdown_tx, engine_shutdown_rx) = mpsc::channel(1);
    let engine_task = tokio::spawn(engine.run(subscriptions.blocks, subscriptions.pending, engine_shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if subscriptions.shutdown.send(()).await.is_err() {
        warn!("Subscription task already stopped");
    }
    if engine_shutdown_tx.send(()).await.is_err() {
        warn!("Engine already stopped");
    }
    engine_task.await??;

    Ok(())
}
