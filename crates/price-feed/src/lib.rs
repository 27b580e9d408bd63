//! Priority-cascade price aggregator
//!
//! Features:
//! - Per-instrument merge of push and poll sources under a strict
//!   priority/recency acceptance rule
//! - Write-through to the cross-process shared cache
//! - Staleness-aware reads (inclusive boundary)
//! - Pool-backed HTTP fallback when push sources go quiet
//! - Automatic WebSocket reconnection

pub mod aggregator;
pub mod feeds;

pub use aggregator::{AggregatorConfig, AggregatorStats, PriceAggregator, PriceEntry};
pub use feeds::{FeedConfig, WsPriceFeed};
