//! WebSocket push-feed adapters

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use mdp_core::{FeedError, FeedResult, PriceSource, PriceUpdate};

use crate::aggregator::PriceAggregator;

/// Push feed configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub ws_url: String,
    /// Priority tier the adapter emits at (`WssFast` for the primary feed,
    /// `WssFallback` for the backup)
    pub source: PriceSource,
    /// Optional subscription payload sent after connect
    pub subscribe_msg: Option<Value>,
    pub reconnect_delay: Duration,
    pub max_reconnects: u32,
}

impl FeedConfig {
    pub fn new(name: impl Into<String>, ws_url: impl Into<String>, source: PriceSource) -> Self {
        Self {
            name: name.into(),
            ws_url: ws_url.into(),
            source,
            subscribe_msg: None,
            reconnect_delay: Duration::from_secs(5),
            max_reconnects: 10,
        }
    }
}

/// Generic WebSocket price feed.
///
/// Parses `{symbol, price}` ticks and pushes them through the aggregator's
/// acceptance rule. All adapter-level failures are caught and logged here;
/// a dead adapter simply stops emitting and the cascade degrades to
/// lower-priority sources by staleness.
pub struct WsPriceFeed {
    config: FeedConfig,
    aggregator: Arc<PriceAggregator>,
    connected: bool,
}

impl WsPriceFeed {
    pub fn new(config: FeedConfig, aggregator: Arc<PriceAggregator>) -> Self {
        Self {
            config,
            aggregator,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Reconnecting run loop. Returns once the feed disconnects normally or
    /// the reconnect budget is exhausted.
    pub async fn run(&mut self) {
        let mut reconnect_count = 0;

        loop {
            match self.connect_and_listen().await {
                Ok(_) => {
                    info!(feed = %self.config.name, "Feed disconnected normally");
                    break;
                }
                Err(e) => {
                    error!(feed = %self.config.name, error = %e, "Feed error");
                    reconnect_count += 1;

                    if reconnect_count >= self.config.max_reconnects {
                        error!(feed = %self.config.name, "Max reconnects reached, feed going quiet");
                        break;
                    }

                    warn!(
                        feed = %self.config.name,
                        delay = ?self.config.reconnect_delay,
                        attempt = reconnect_count,
                        max = self.config.max_reconnects,
                        "Reconnecting"
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
        self.connected = false;
    }

    async fn connect_and_listen(&mut self) -> anyhow::Result<()> {
        info!(feed = %self.config.name, url = %self.config.ws_url, "Connecting");

        let (ws_stream, _) = connect_async(&self.config.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        self.connected = true;
        info!(feed = %self.config.name, "Connected");

        if let Some(subscribe) = &self.config.subscribe_msg {
            write.send(Message::Text(subscribe.to_string())).await?;
        }

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match self.parse_tick(&text) {
                    Ok(update) => {
                        self.aggregator.apply_update(update);
                    }
                    Err(FeedError::InvalidMessage(reason)) => {
                        // Subscription acks and heartbeats land here
                        debug!(feed = %self.config.name, %reason, "Skipped non-tick message");
                    }
                    Err(e) => {
                        debug!(feed = %self.config.name, error = %e, "Skipped message");
                    }
                },
                Ok(Message::Ping(data)) => {
                    write.send(Message::Pong(data)).await?;
                }
                Ok(Message::Close(_)) => {
                    info!(feed = %self.config.name, "WebSocket closed by server");
                    break;
                }
                Err(e) => {
                    error!(feed = %self.config.name, error = %e, "WebSocket error");
                    self.connected = false;
                    return Err(e.into());
                }
                _ => {}
            }
        }

        self.connected = false;
        Ok(())
    }

    /// Extract a price tick from a feed message. Accepts `symbol`/`mint`
    /// identifiers and numeric or string prices; anything else is reported
    /// as an invalid message and skipped by the caller.
    fn parse_tick(&self, text: &str) -> FeedResult<PriceUpdate> {
        let json: Value = serde_json::from_str(text)
            .map_err(|e| FeedError::InvalidMessage(e.to_string()))?;

        let symbol = json
            .get("symbol")
            .or_else(|| json.get("mint"))
            .and_then(Value::as_str)
            .ok_or_else(|| FeedError::InvalidMessage("missing symbol".into()))?;

        let price = match json.get("price") {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| FeedError::InvalidMessage("non-finite price".into()))?,
            Some(Value::String(s)) => s
                .parse()
                .map_err(|_| FeedError::InvalidMessage("unparseable price".into()))?,
            _ => return Err(FeedError::InvalidMessage("missing price".into())),
        };

        let mut update = PriceUpdate::new(symbol, price, self.config.source);
        if let Some(ts) = json.get("ts").and_then(Value::as_f64) {
            update = update.with_timestamp(ts);
        }
        if let Some(confidence) = json.get("confidence").and_then(Value::as_f64) {
            update = update.with_confidence(confidence);
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregatorConfig;
    use mdp_core::{CacheConfig, PoolConfig, ProviderConfig};
    use mdp_rpc_pool::RpcPool;
    use mdp_shared_cache::SharedCache;

    fn feed_for(dir: &tempfile::TempDir, source: PriceSource) -> WsPriceFeed {
        let cache = Arc::new(SharedCache::new(CacheConfig::new(
            dir.path().join("cache.json"),
        )));
        let pool = Arc::new(
            RpcPool::new(PoolConfig {
                providers: vec![ProviderConfig {
                    name: "Test".into(),
                    url: "http://localhost:1".into(),
                    weight: 1.0,
                    enabled: true,
                }],
                ..Default::default()
            })
            .unwrap(),
        );
        let aggregator = Arc::new(PriceAggregator::new(AggregatorConfig::default(), cache, pool));
        WsPriceFeed::new(
            FeedConfig::new("test", "ws://localhost:1", source),
            aggregator,
        )
    }

    #[test]
    fn test_parse_tick_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let feed = feed_for(&dir, PriceSource::WssFast);

        let update = feed
            .parse_tick(r#"{"symbol": "SOL", "price": 150.5}"#)
            .unwrap();
        assert_eq!(update.symbol, "SOL");
        assert_eq!(update.price, 150.5);
        assert_eq!(update.source, PriceSource::WssFast);

        // Mint identifier and string price
        let update = feed
            .parse_tick(r#"{"mint": "EPjFW...", "price": "0.9999", "ts": 42.0}"#)
            .unwrap();
        assert_eq!(update.symbol, "EPjFW...");
        assert_eq!(update.price, 0.9999);
        assert_eq!(update.timestamp, 42.0);
    }

    #[test]
    fn test_parse_tick_rejects_non_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let feed = feed_for(&dir, PriceSource::WssFallback);

        assert!(feed.parse_tick("not json").is_err());
        assert!(feed.parse_tick(r#"{"result": "subscribed"}"#).is_err());
        assert!(feed.parse_tick(r#"{"symbol": "SOL"}"#).is_err());
        assert!(feed.parse_tick(r#"{"symbol": "SOL", "price": true}"#).is_err());
    }

    #[test]
    fn test_fallback_feed_emits_at_its_tier() {
        let dir = tempfile::tempdir().unwrap();
        let feed = feed_for(&dir, PriceSource::WssFallback);
        let update = feed
            .parse_tick(r#"{"symbol": "SOL", "price": 1.0}"#)
            .unwrap();
        assert_eq!(update.source, PriceSource::WssFallback);
    }
}
