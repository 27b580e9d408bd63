//! Typed schema of the on-disk cache document
//!
//! Top-level keys are wire format: sibling dashboards and trading engines
//! parse this file directly. Unknown fields are preserved through
//! read-modify-write cycles but never interpreted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use mdp_core::is_fresh;

/// Seconds without a heartbeat or price write before the broker is
/// considered dead by consumers.
pub const BROKER_LIVENESS_WINDOW_SECS: f64 = 60.0;

/// Bumped on any incompatible change to the document layout
pub const SCHEMA_VERSION: u32 = 1;

fn current_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// One sample in a price history ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub price: f64,
    pub ts: f64,
}

/// Current price plus a bounded history for downstream indicators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceRecord {
    pub price: f64,
    pub source: String,
    pub timestamp: f64,
    #[serde(default)]
    pub history: Vec<HistoryPoint>,
}

impl PriceRecord {
    pub fn is_fresh(&self, max_age: f64, now: f64) -> bool {
        is_fresh(self.timestamp, max_age, now)
    }

    /// Append a sample, evicting the oldest beyond `depth`.
    pub fn push_history(&mut self, price: f64, ts: f64, depth: usize) {
        self.history.push(HistoryPoint { price, ts });
        if self.history.len() > depth {
            let overflow = self.history.len() - depth;
            self.history.drain(..overflow);
        }
    }
}

/// Wallet snapshot written by the broker's wallet scanner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletState {
    #[serde(default)]
    pub usdc: f64,
    #[serde(default)]
    pub sol: f64,
    #[serde(default)]
    pub held_assets: Map<String, Value>,
    #[serde(default)]
    pub timestamp: f64,
}

/// Safety validation verdict for one instrument
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyRecord {
    pub safe: bool,
    #[serde(default)]
    pub liquidity: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub timestamp: f64,
}

/// Rich market data (dex id, liquidity, volume...). Fields beyond the
/// timestamp are producer-defined and passed through untyped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketRecord {
    #[serde(default)]
    pub timestamp: f64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Global market regime (volatility, trend, quality score...)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeRecord {
    #[serde(default)]
    pub timestamp: f64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Smart-money trust score in [0, 1]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustRecord {
    pub score: f64,
    #[serde(default)]
    pub timestamp: f64,
}

/// Open positions snapshot shared for cross-engine awareness
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionsRecord {
    #[serde(default)]
    pub positions: Vec<Value>,
    #[serde(default)]
    pub timestamp: f64,
}

/// The single persisted JSON object.
///
/// Missing file or parse failure yields `CacheDocument::default()` (the
/// empty template), so readers never observe a half-formed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDocument {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub prices: HashMap<String, PriceRecord>,
    #[serde(default)]
    pub market_data: HashMap<String, MarketRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<WalletState>,
    #[serde(default)]
    pub safety: HashMap<String, SafetyRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<RegimeRecord>,
    #[serde(default)]
    pub trust_scores: HashMap<String, TrustRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_positions: Option<PositionsRecord>,
    #[serde(default)]
    pub last_update: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_started: Option<f64>,
    #[serde(default)]
    pub broker_heartbeat: f64,
    /// Unknown top-level keys from other writers, carried through verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for CacheDocument {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            prices: HashMap::new(),
            market_data: HashMap::new(),
            wallet: None,
            safety: HashMap::new(),
            regime: None,
            trust_scores: HashMap::new(),
            active_positions: None,
            last_update: 0.0,
            broker_pid: None,
            broker_started: None,
            broker_heartbeat: 0.0,
            extra: Map::new(),
        }
    }
}

impl CacheDocument {
    /// Namespaces understood by `invalidate`
    pub const NAMESPACES: [&'static str; 7] = [
        "prices",
        "market_data",
        "wallet",
        "safety",
        "regime",
        "trust_scores",
        "active_positions",
    ];

    /// Record one price write: update the current value and append to the
    /// bounded history ring.
    pub fn record_price(
        &mut self,
        symbol: &str,
        price: f64,
        source: &str,
        ts: f64,
        history_depth: usize,
    ) {
        let entry = self.prices.entry(symbol.to_string()).or_default();
        entry.price = price;
        entry.source = source.to_string();
        entry.timestamp = ts;
        entry.push_history(price, ts, history_depth);
        self.last_update = ts;
    }

    /// Zero the timestamps of one namespace without deleting values, so the
    /// next read sees it as stale and the next write is re-read as fresh.
    /// Returns false for an unknown namespace.
    pub fn invalidate(&mut self, namespace: &str) -> bool {
        match namespace {
            "prices" => self.prices.values_mut().for_each(|e| e.timestamp = 0.0),
            "market_data" => self
                .market_data
                .values_mut()
                .for_each(|e| e.timestamp = 0.0),
            "wallet" => {
                if let Some(wallet) = self.wallet.as_mut() {
                    wallet.timestamp = 0.0;
                }
            }
            "safety" => self.safety.values_mut().for_each(|e| e.timestamp = 0.0),
            "regime" => {
                if let Some(regime) = self.regime.as_mut() {
                    regime.timestamp = 0.0;
                }
            }
            "trust_scores" => self
                .trust_scores
                .values_mut()
                .for_each(|e| e.timestamp = 0.0),
            "active_positions" => {
                if let Some(positions) = self.active_positions.as_mut() {
                    positions.timestamp = 0.0;
                }
            }
            _ => return false,
        }
        true
    }

    /// Liveness rule consumed by sibling processes:
    /// alive iff `now - max(last_update, broker_heartbeat) < 60s`.
    pub fn broker_alive(&self, now: f64) -> bool {
        now - self.last_update.max(self.broker_heartbeat) < BROKER_LIVENESS_WINDOW_SECS
    }
}
