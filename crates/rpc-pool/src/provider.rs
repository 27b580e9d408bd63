//! Per-provider identity and health state

use parking_lot::Mutex;
use tracing::{debug, warn};

use mdp_core::{now_ts, ProviderConfig};

/// Provider health status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Healthy,
    RateLimited,
    Error,
}

/// EMA smoothing for latency: new = old * 0.9 + sample * 0.1
const LATENCY_EMA_KEEP: f64 = 0.9;

/// Cap on the lighter backoff applied for generic (non-429) errors
const GENERIC_BACKOFF_CAP_SECS: f64 = 10.0;

#[derive(Debug)]
struct ProviderState {
    status: ProviderStatus,
    error_count: u32,
    /// Unix seconds; provider is skipped until this passes.
    /// Non-decreasing across consecutive failures, reset by a success.
    backoff_until: f64,
    last_backoff_secs: f64,
    request_count: u64,
    success_count: u64,
    avg_latency_ms: f64,
}

/// One configured JSON-RPC endpoint with its mutable health state.
///
/// Owned by the pool for the whole process lifetime; mutated on every call
/// outcome. State sits behind a mutex so concurrent callers see consistent
/// per-provider updates, though snapshots across providers are not
/// linearizable (and do not need to be).
#[derive(Debug)]
pub struct RpcProvider {
    pub name: String,
    pub url: String,
    /// Static selection weight (> 0), higher = drawn more often
    pub weight: f64,
    base_backoff_secs: f64,
    max_backoff_secs: f64,
    state: Mutex<ProviderState>,
}

impl RpcProvider {
    pub fn new(config: &ProviderConfig, base_backoff_secs: f64, max_backoff_secs: f64) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            weight: config.weight.max(f64::MIN_POSITIVE),
            base_backoff_secs,
            max_backoff_secs,
            state: Mutex::new(ProviderState {
                status: ProviderStatus::Healthy,
                error_count: 0,
                backoff_until: 0.0,
                last_backoff_secs: 0.0,
                request_count: 0,
                success_count: 0,
                avg_latency_ms: 0.0,
            }),
        }
    }

    /// Available = healthy, or backoff window has expired.
    pub fn is_available(&self, now: f64) -> bool {
        let state = self.state.lock();
        state.status == ProviderStatus::Healthy || now >= state.backoff_until
    }

    pub fn backoff_until(&self) -> f64 {
        self.state.lock().backoff_until
    }

    /// Record a successful request: clears backoff, resets the error
    /// counter and folds the round-trip latency into the EMA.
    pub fn mark_success(&self, latency_ms: f64) {
        let mut state = self.state.lock();
        state.request_count += 1;
        state.success_count += 1;
        state.status = ProviderStatus::Healthy;
        state.error_count = 0;
        state.backoff_until = 0.0;
        state.last_backoff_secs = 0.0;
        state.avg_latency_ms = if state.success_count > 1 {
            state.avg_latency_ms * LATENCY_EMA_KEEP + latency_ms * (1.0 - LATENCY_EMA_KEEP)
        } else {
            latency_ms
        };
    }

    /// Record a rate-limit response: exponential backoff
    /// `min(base * 2^(n-1), max)`. Returns the applied backoff seconds.
    pub fn mark_rate_limited(&self) -> f64 {
        let mut state = self.state.lock();
        state.request_count += 1;
        state.error_count += 1;
        state.status = ProviderStatus::RateLimited;

        let backoff = (self.base_backoff_secs
            * 2f64.powi(state.error_count.saturating_sub(1) as i32))
        .min(self.max_backoff_secs);
        state.backoff_until = state.backoff_until.max(now_ts() + backoff);
        state.last_backoff_secs = backoff;

        warn!(provider = %self.name, backoff_secs = backoff, "Rate limited");
        backoff
    }

    /// Record a generic error (HTTP >= 500, timeout, RPC error body):
    /// lighter linear backoff `min(base * n, 10s)`. Returns the applied
    /// backoff seconds.
    pub fn mark_error(&self, reason: &str) -> f64 {
        let mut state = self.state.lock();
        state.request_count += 1;
        state.error_count += 1;
        state.status = ProviderStatus::Error;

        let backoff =
            (self.base_backoff_secs * state.error_count as f64).min(GENERIC_BACKOFF_CAP_SECS);
        state.backoff_until = state.backoff_until.max(now_ts() + backoff);
        state.last_backoff_secs = backoff;

        debug!(provider = %self.name, backoff_secs = backoff, %reason, "Provider error");
        backoff
    }

    pub fn snapshot(&self) -> ProviderSnapshot {
        let state = self.state.lock();
        ProviderSnapshot {
            name: self.name.clone(),
            status: state.status,
            error_count: state.error_count,
            backoff_until: state.backoff_until,
            last_backoff_secs: state.last_backoff_secs,
            request_count: state.request_count,
            success_count: state.success_count,
            avg_latency_ms: state.avg_latency_ms,
            available: state.status == ProviderStatus::Healthy
                || now_ts() >= state.backoff_until,
        }
    }
}

/// Point-in-time copy of a provider's counters for monitoring
#[derive(Debug, Clone)]
pub struct ProviderSnapshot {
    pub name: String,
    pub status: ProviderStatus,
    pub error_count: u32,
    pub backoff_until: f64,
    pub last_backoff_secs: f64,
    pub request_count: u64,
    pub success_count: u64,
    pub avg_latency_ms: f64,
    pub available: bool,
}

impl ProviderSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.request_count as f64
    }
}
