//! Data broker daemon
//!
//! Owns the provider pool and the aggregator, writes prices and heartbeats
//! into the shared cache for sibling processes to consume.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mdp_core::{CacheConfig, PoolConfig, PriceSource};
use mdp_price_feed::{AggregatorConfig, FeedConfig, PriceAggregator, WsPriceFeed};
use mdp_rpc_pool::RpcPool;
use mdp_shared_cache::SharedCache;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const POLL_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting market data broker v{}", env!("CARGO_PKG_VERSION"));

    let pool_config_path =
        env::var("MDP_RPC_CONFIG").unwrap_or_else(|_| "config/rpc_pool.json".to_string());
    let cache_path =
        env::var("MDP_CACHE_PATH").unwrap_or_else(|_| "data/price_cache.json".to_string());
    let watchlist: Vec<String> = env::var("MDP_WATCHLIST")
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if let Some(parent) = std::path::Path::new(&cache_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = Arc::new(RpcPool::new(PoolConfig::from_json_file(&pool_config_path)?)?);
    pool.benchmark().await;

    let cache = Arc::new(SharedCache::new(CacheConfig::new(&cache_path)));
    let aggregator = Arc::new(PriceAggregator::new(
        AggregatorConfig::default(),
        Arc::clone(&cache),
        Arc::clone(&pool),
    ));

    // Primary push feed, if configured
    let mut feed_handles = Vec::new();
    if let Ok(ws_url) = env::var("MDP_WSS_URL") {
        let mut feed = WsPriceFeed::new(
            FeedConfig::new("primary-wss", ws_url, PriceSource::WssFast),
            Arc::clone(&aggregator),
        );
        feed_handles.push(tokio::spawn(async move { feed.run().await }));
        info!("Started primary WSS feed");
    }
    if let Ok(ws_url) = env::var("MDP_WSS_FALLBACK_URL") {
        let mut feed = WsPriceFeed::new(
            FeedConfig::new("fallback-wss", ws_url, PriceSource::WssFallback),
            Arc::clone(&aggregator),
        );
        feed_handles.push(tokio::spawn(async move { feed.run().await }));
        info!("Started fallback WSS feed");
    }

    cache.set_broker_info(std::process::id());

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut poll = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if !cache.set_broker_info(std::process::id()) {
                    warn!("Heartbeat write dropped");
                }
            }
            _ = poll.tick() => {
                if !watchlist.is_empty() {
                    let applied = aggregator.fetch_batch_prices(&watchlist).await;
                    let stats = aggregator.stats();
                    info!(
                        applied,
                        instruments = stats.instrument_count,
                        accepted = stats.accepted,
                        rejected = stats.rejected,
                        "Fallback poll complete"
                    );
                }
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    for handle in feed_handles {
        handle.abort();
    }
    info!("Broker stopped");
    Ok(())
}
