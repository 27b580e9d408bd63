//! Priority-cascade merge of competing price sources

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, warn};

use mdp_core::{is_fresh, now_ts, PriceSource, PriceUpdate};
use mdp_rpc_pool::RpcPool;
use mdp_shared_cache::SharedCache;

/// In-process observer invoked synchronously on every accepted update
pub type Observer = Box<dyn Fn(&PriceUpdate) + Send + Sync>;

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// JSON-RPC method used for the pool-backed batch fallback
    pub price_method: String,
    /// Instruments per fallback request
    pub batch_chunk_size: usize,
    /// Bound on the in-process observer set
    pub max_observers: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            price_method: "getPrices".to_string(),
            batch_chunk_size: 30,
            max_observers: 16,
        }
    }
}

/// Authoritative value for one instrument
#[derive(Debug, Clone, PartialEq)]
pub struct PriceEntry {
    pub price: f64,
    pub source: PriceSource,
    pub timestamp: f64,
    pub confidence: f64,
}

impl PriceEntry {
    fn from_update(update: &PriceUpdate) -> Self {
        Self {
            price: update.price,
            source: update.source,
            timestamp: update.timestamp,
            confidence: update.confidence,
        }
    }

    pub fn age(&self, now: f64) -> f64 {
        (now - self.timestamp).max(0.0)
    }
}

/// Merges possibly-conflicting, possibly-out-of-order updates from several
/// sources into one authoritative value per instrument.
///
/// The only ordering guarantee is per-instrument: an update is accepted iff
/// there is no existing entry, its source outranks the existing one, or it
/// is a fresher update from the same source. There is no total order across
/// instruments.
pub struct PriceAggregator {
    config: AggregatorConfig,
    entries: DashMap<String, PriceEntry>,
    cache: Arc<SharedCache>,
    pool: Arc<RpcPool>,
    observers: RwLock<Vec<Observer>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    last_update: RwLock<f64>,
}

impl PriceAggregator {
    pub fn new(config: AggregatorConfig, cache: Arc<SharedCache>, pool: Arc<RpcPool>) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            cache,
            pool,
            observers: RwLock::new(Vec::new()),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            last_update: RwLock::new(0.0),
        }
    }

    /// Apply one update under the acceptance rule:
    ///
    /// ```text
    /// accept ⟺ no existing entry
    ///         ∨ update.rank < existing.rank
    ///         ∨ (same source ∧ update.timestamp > existing.timestamp)
    /// ```
    ///
    /// On acceptance the value is stored, written through to the shared
    /// cache and handed to every observer. Returns whether the update was
    /// accepted.
    pub fn apply_update(&self, update: PriceUpdate) -> bool {
        if !update.is_valid() {
            debug!(symbol = %update.symbol, price = update.price, "Rejected invalid price");
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let accepted = match self.entries.entry(update.symbol.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(PriceEntry::from_update(&update));
                true
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                let wins = update.source.rank() < existing.source.rank()
                    || (update.source == existing.source
                        && update.timestamp > existing.timestamp);
                if wins {
                    slot.insert(PriceEntry::from_update(&update));
                }
                wins
            }
        };

        if !accepted {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        *self.last_update.write() = now_ts();

        // Write-through: the accepted value is persisted before observers
        // see it. A dropped cache write degrades to in-memory-only.
        //
        // Runs outside the map entry guard, so two concurrently accepted
        // updates for one symbol can reach the file in either order: file
        // readers get last-writer-wins at document granularity, while the
        // in-memory entry always holds the arbitration winner.
        if !self.cache.write_price(&update.symbol, update.price, update.source) {
            warn!(symbol = %update.symbol, "Write-through to shared cache dropped");
        }

        self.notify(&update);
        true
    }

    /// Invoke observers synchronously; one panicking observer must not
    /// prevent the rest from running.
    fn notify(&self, update: &PriceUpdate) {
        let observers = self.observers.read();
        for (index, observer) in observers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| observer(update))).is_err() {
                warn!(observer = index, symbol = %update.symbol, "Observer panicked");
            }
        }
    }

    /// Register an in-process observer. Returns false once the bounded set
    /// is full.
    pub fn subscribe(&self, observer: Observer) -> bool {
        let mut observers = self.observers.write();
        if observers.len() >= self.config.max_observers {
            warn!(limit = self.config.max_observers, "Observer set full");
            return false;
        }
        observers.push(observer);
        true
    }

    /// The authoritative value iff fresh within `max_age` (inclusive
    /// boundary); a stale value reads as absent, not wrong.
    pub fn get_price(&self, symbol: &str, max_age: f64) -> Option<PriceEntry> {
        let entry = self.entries.get(symbol)?;
        if !is_fresh(entry.timestamp, max_age, now_ts()) {
            return None;
        }
        Some(entry.clone())
    }

    /// All fresh instruments under the same filter.
    pub fn get_all_prices(&self, max_age: f64) -> Vec<(String, PriceEntry)> {
        let now = now_ts();
        self.entries
            .iter()
            .filter(|e| is_fresh(e.value().timestamp, max_age, now))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// HTTP fallback through the provider pool. Results pass through
    /// `apply_update` at `HttpPrimary` priority, so a concurrently arriving
    /// push update can never be clobbered. Returns the number of accepted
    /// updates.
    pub async fn fetch_batch_prices(&self, symbols: &[String]) -> usize {
        let mut applied = 0;

        for chunk in symbols.chunks(self.config.batch_chunk_size.max(1)) {
            let result = self
                .pool
                .call(&self.config.price_method, json!([chunk]))
                .await;

            let prices = match result {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "Batch price fetch failed");
                    continue;
                }
            };

            let Some(map) = prices.as_object() else {
                warn!("Batch price response is not an object");
                continue;
            };

            for (symbol, raw) in map {
                let Some(price) = parse_price_field(raw) else {
                    debug!(%symbol, "Unparseable price in batch response");
                    continue;
                };
                let update = PriceUpdate::new(symbol.clone(), price, PriceSource::HttpPrimary);
                if self.apply_update(update) {
                    applied += 1;
                }
            }
        }

        applied
    }

    pub fn stats(&self) -> AggregatorStats {
        let last_update = *self.last_update.read();
        AggregatorStats {
            instrument_count: self.entries.len(),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            last_update_age: if last_update > 0.0 {
                now_ts() - last_update
            } else {
                f64::INFINITY
            },
        }
    }
}

/// Providers report batch prices either as bare numbers or as objects with
/// a `price` field (number or numeric string).
fn parse_price_field(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::Object(fields) => match fields.get("price") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        },
        _ => None,
    }
}

/// Aggregator statistics
#[derive(Debug, Clone)]
pub struct AggregatorStats {
    pub instrument_count: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub last_update_age: f64,
}
