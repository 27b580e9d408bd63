//! Load-balanced JSON-RPC provider pool
//!
//! Features:
//! - Weighted random selection across providers
//! - Rate-limit detection (HTTP 429) with exponential backoff
//! - Lighter backoff for generic errors, auto-failover on retry
//! - Latency benchmark that picks the active provider for simple callers

pub mod pool;
pub mod provider;

pub use pool::{PoolStats, RpcPool};
pub use provider::{ProviderSnapshot, ProviderStatus, RpcProvider};
