//! Cross-process shared cache
//!
//! A single JSON document on disk, guarded by an advisory lock and written
//! with an atomic temp-file rename. The data broker writes; trading
//! engines, dashboards and sibling processes read.

pub mod document;
pub mod store;

pub use document::{
    CacheDocument, HistoryPoint, MarketRecord, PositionsRecord, PriceRecord, RegimeRecord,
    SafetyRecord, TrustRecord, WalletState,
};
pub use store::{BrokerStatus, CachedPrice, SharedCache};
