//! Core type definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Data source tier for a price update.
///
/// Lower rank = more trusted / fresher path. The rank ordering drives the
/// aggregator's acceptance rule: a lower-priority source can never clobber
/// a value written by a higher-priority one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceSource {
    /// Primary push feed (low-latency WebSocket)
    WssFast,
    /// Secondary push feed
    WssFallback,
    /// Primary HTTP poll (pool-backed batch fetch)
    HttpPrimary,
    /// Secondary HTTP poll
    HttpSecondary,
    /// Backfilled / historical data, lowest trust
    Stale,
}

impl PriceSource {
    pub fn rank(&self) -> u8 {
        match self {
            PriceSource::WssFast => 1,
            PriceSource::WssFallback => 2,
            PriceSource::HttpPrimary => 3,
            PriceSource::HttpSecondary => 4,
            PriceSource::Stale => 99,
        }
    }

    /// Short tag written into the shared cache file. Sibling consumers
    /// match on these strings, so they are part of the wire format.
    pub fn tag(&self) -> &'static str {
        match self {
            PriceSource::WssFast => "WSS",
            PriceSource::WssFallback => "WSS2",
            PriceSource::HttpPrimary => "HTTP",
            PriceSource::HttpSecondary => "HTTP2",
            PriceSource::Stale => "STALE",
        }
    }

    /// Parse a cache-file tag back into a source. Unknown tags map to
    /// `Stale` so foreign writers always lose priority arbitration.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "WSS" => PriceSource::WssFast,
            "WSS2" => PriceSource::WssFallback,
            "HTTP" | "BATCH" => PriceSource::HttpPrimary,
            "HTTP2" => PriceSource::HttpSecondary,
            _ => PriceSource::Stale,
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl PartialOrd for PriceSource {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriceSource {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Immutable price update produced by a feed adapter.
///
/// Superseded (never mutated) by later updates; consumed once by the
/// aggregator's merge step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Instrument identifier (mint address or symbol)
    pub symbol: String,
    /// Price in quote units, must be finite and > 0
    pub price: f64,
    pub source: PriceSource,
    /// Unix seconds
    pub timestamp: f64,
    /// Adapter confidence in [0, 1]
    pub confidence: f64,
}

impl PriceUpdate {
    pub fn new(symbol: impl Into<String>, price: f64, source: PriceSource) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            source,
            timestamp: now_ts(),
            confidence: 1.0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// A usable update carries a finite positive price.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }

    pub fn age(&self, now: f64) -> f64 {
        (now - self.timestamp).max(0.0)
    }
}

/// Current wall-clock time as unix seconds.
///
/// Stored as f64 for wire compatibility with the sibling consumers of the
/// cache file.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Inclusive staleness rule, applied uniformly across the plane:
/// a value is fresh iff `now - timestamp <= max_age`.
pub fn is_fresh(timestamp: f64, max_age: f64, now: f64) -> bool {
    now - timestamp <= max_age
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_rank_ordering() {
        assert!(PriceSource::WssFast < PriceSource::WssFallback);
        assert!(PriceSource::WssFallback < PriceSource::HttpPrimary);
        assert!(PriceSource::HttpPrimary < PriceSource::HttpSecondary);
        assert!(PriceSource::HttpSecondary < PriceSource::Stale);
    }

    #[test]
    fn test_tag_round_trip() {
        for src in [
            PriceSource::WssFast,
            PriceSource::WssFallback,
            PriceSource::HttpPrimary,
            PriceSource::HttpSecondary,
            PriceSource::Stale,
        ] {
            assert_eq!(PriceSource::from_tag(src.tag()), src);
        }
        // Unknown writers fall to the bottom of the cascade
        assert_eq!(PriceSource::from_tag("SOMETHING"), PriceSource::Stale);
        // Legacy batch tag maps to the HTTP tier
        assert_eq!(PriceSource::from_tag("BATCH"), PriceSource::HttpPrimary);
    }

    #[test]
    fn test_staleness_boundary_inclusive() {
        // age == max_age is fresh, strictly older is not
        assert!(is_fresh(100.0, 30.0, 130.0));
        assert!(!is_fresh(100.0, 30.0, 130.001));
    }

    #[test]
    fn test_update_validity() {
        assert!(PriceUpdate::new("SOL", 150.0, PriceSource::WssFast).is_valid());
        assert!(!PriceUpdate::new("SOL", 0.0, PriceSource::WssFast).is_valid());
        assert!(!PriceUpdate::new("SOL", f64::NAN, PriceSource::WssFast).is_valid());
        assert!(!PriceUpdate::new("SOL", -1.0, PriceSource::WssFast).is_valid());
    }
}
