//! Weighted provider pool with failover

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use mdp_core::{now_ts, PoolConfig, PoolError, PoolResult};

use crate::provider::{ProviderSnapshot, RpcProvider};

/// Timeout for the lightweight benchmark ping
const BENCHMARK_TIMEOUT: Duration = Duration::from_secs(3);

/// Load-balanced JSON-RPC pool.
///
/// One pool per process, passed by `Arc` to every consumer. `call`/`post`
/// use weighted random selection across all providers; `active`/`switch`
/// maintain a ring pointer for callers that want a single pinned endpoint.
pub struct RpcPool {
    providers: Vec<Arc<RpcProvider>>,
    client: reqwest::Client,
    config: PoolConfig,
    /// Ring pointer for single-endpoint callers; benign races tolerated
    active: AtomicUsize,
    request_id: AtomicU64,
}

impl RpcPool {
    /// Build a pool from configuration. Zero enabled providers is the only
    /// fatal misconfiguration in this layer.
    pub fn new(config: PoolConfig) -> PoolResult<Self> {
        let providers: Vec<Arc<RpcProvider>> = config
            .providers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| {
                Arc::new(RpcProvider::new(
                    p,
                    config.base_backoff_secs,
                    config.max_backoff_secs,
                ))
            })
            .collect();

        if providers.is_empty() {
            return Err(PoolError::NoProviders);
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| PoolError::NetworkError {
                provider: "client".into(),
                reason: e.to_string(),
            })?;

        info!(
            providers = providers.len(),
            names = ?providers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            "RPC pool loaded"
        );

        Ok(Self {
            providers,
            client,
            config,
            active: AtomicUsize::new(0),
            request_id: AtomicU64::new(1),
        })
    }

    /// Issue one JSON-RPC 2.0 call, selecting providers internally.
    /// Retries against up to `max_retries` distinct providers; returns the
    /// `result` field on first success.
    pub async fn call(&self, method: &str, params: Value) -> PoolResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.dispatch(&payload, self.config.request_timeout()).await
    }

    /// Raw JSON-RPC post through the same selection/failover machinery,
    /// with a caller-supplied per-attempt timeout.
    pub async fn post(&self, payload: &Value, timeout: Duration) -> PoolResult<Value> {
        self.dispatch(payload, timeout).await
    }

    async fn dispatch(&self, payload: &Value, timeout: Duration) -> PoolResult<Value> {
        let mut tried: HashSet<usize> = HashSet::new();
        let mut last_error: Option<PoolError> = None;

        for _ in 0..self.config.max_retries {
            let Some(index) = self.select_provider(&tried) else {
                break;
            };
            tried.insert(index);
            let provider = Arc::clone(&self.providers[index]);

            match self.attempt(&provider, payload, timeout).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!(provider = %provider.name, error = %e, "Attempt failed, rotating");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(PoolError::ProviderUnavailable))
    }

    /// One HTTP attempt against one provider, with outcome classification.
    async fn attempt(
        &self,
        provider: &RpcProvider,
        payload: &Value,
        timeout: Duration,
    ) -> PoolResult<Value> {
        let started = Instant::now();

        let response = match self
            .client
            .post(&provider.url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let reason = if e.is_timeout() {
                    "timeout".to_string()
                } else {
                    e.to_string()
                };
                provider.mark_error(&reason);
                if e.is_connect() {
                    // Hard connection failure: rotate the active pointer so
                    // pinned callers stop hitting a dead endpoint.
                    self.switch("connection error");
                }
                return Err(PoolError::NetworkError {
                    provider: provider.name.clone(),
                    reason,
                });
            }
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            provider.mark_rate_limited();
            return Err(PoolError::RateLimited {
                provider: provider.name.clone(),
            });
        }

        if !status.is_success() {
            let reason = format!("HTTP {}", status.as_u16());
            provider.mark_error(&reason);
            return Err(PoolError::NetworkError {
                provider: provider.name.clone(),
                reason,
            });
        }

        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                provider.mark_error("invalid JSON body");
                return Err(PoolError::MalformedResponse {
                    provider: provider.name.clone(),
                    reason: e.to_string(),
                });
            }
        };

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());

            // Some providers report throttling inside the RPC error body
            let lowered = message.to_lowercase();
            if lowered.contains("rate") || lowered.contains("limit") {
                provider.mark_rate_limited();
                return Err(PoolError::RateLimited {
                    provider: provider.name.clone(),
                });
            }

            provider.mark_error(&message);
            return Err(PoolError::RpcError {
                provider: provider.name.clone(),
                message,
            });
        }

        match body.get("result") {
            Some(result) => {
                provider.mark_success(latency_ms);
                Ok(result.clone())
            }
            None => {
                provider.mark_error("no result field");
                Err(PoolError::MalformedResponse {
                    provider: provider.name.clone(),
                    reason: "response carries neither result nor error".into(),
                })
            }
        }
    }

    /// Weighted random draw among untried providers outside their backoff
    /// window. When every candidate is backing off, takes the one whose
    /// window expires soonest.
    fn select_provider(&self, tried: &HashSet<usize>) -> Option<usize> {
        let now = now_ts();
        let candidates: Vec<usize> = (0..self.providers.len())
            .filter(|i| !tried.contains(i) && self.providers[*i].is_available(now))
            .collect();

        if candidates.is_empty() {
            return (0..self.providers.len())
                .filter(|i| !tried.contains(i))
                .min_by(|a, b| {
                    self.providers[*a]
                        .backoff_until()
                        .total_cmp(&self.providers[*b].backoff_until())
                });
        }

        let total: f64 = candidates.iter().map(|i| self.providers[*i].weight).sum();
        if total <= 0.0 {
            return candidates.first().copied();
        }
        let mut r = rand::thread_rng().gen_range(0.0..total);
        for &i in &candidates {
            r -= self.providers[i].weight;
            if r <= 0.0 {
                return Some(i);
            }
        }
        candidates.last().copied()
    }

    /// Ping every provider with `getHealth`, fold round-trip latency into
    /// the EMA and pin the active pointer to the fastest healthy responder.
    /// Runs once at startup; safe to invoke on demand.
    pub async fn benchmark(&self) -> Vec<(String, Option<f64>)> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "getHealth",
            "params": [],
        });

        let mut best: Option<(usize, f64)> = None;
        let mut report = Vec::with_capacity(self.providers.len());

        for (i, provider) in self.providers.iter().enumerate() {
            let started = Instant::now();
            let healthy = self
                .client
                .post(&provider.url)
                .json(&payload)
                .timeout(BENCHMARK_TIMEOUT)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            if healthy {
                provider.mark_success(latency_ms);
                if best.map_or(true, |(_, b)| latency_ms < b) {
                    best = Some((i, latency_ms));
                }
                report.push((provider.name.clone(), Some(latency_ms)));
            } else {
                provider.mark_error("benchmark ping failed");
                report.push((provider.name.clone(), None));
            }
        }

        match best {
            Some((i, latency_ms)) => {
                self.active.store(i, Ordering::Relaxed);
                info!(
                    provider = %self.providers[i].name,
                    latency_ms,
                    "Benchmark complete, active provider set"
                );
            }
            None => warn!("Benchmark found no healthy provider"),
        }

        report
    }

    /// Force rotation of the active pointer to the next provider in ring
    /// order, logging the reason.
    pub fn switch(&self, reason: &str) {
        let current = self.active.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.active.store(next, Ordering::Relaxed);
        warn!(
            from = %self.providers[current % self.providers.len()].name,
            to = %self.providers[next].name,
            %reason,
            "Switched active provider"
        );
    }

    /// Currently pinned provider for single-endpoint callers
    pub fn active(&self) -> Arc<RpcProvider> {
        let index = self.active.load(Ordering::Relaxed) % self.providers.len();
        Arc::clone(&self.providers[index])
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Per-provider counters/status for monitoring
    pub fn stats(&self) -> PoolStats {
        let now = now_ts();
        let providers: Vec<ProviderSnapshot> =
            self.providers.iter().map(|p| p.snapshot()).collect();
        let available = self
            .providers
            .iter()
            .filter(|p| p.is_available(now))
            .count();

        PoolStats {
            total: providers.len(),
            available,
            active: self.active().name.clone(),
            providers,
        }
    }
}

/// Pool status snapshot
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub active: String,
    pub providers: Vec<ProviderSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdp_core::ProviderConfig;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pool_config(providers: Vec<(&str, String, f64)>) -> PoolConfig {
        PoolConfig {
            providers: providers
                .into_iter()
                .map(|(name, url, weight)| ProviderConfig {
                    name: name.into(),
                    url,
                    weight,
                    enabled: true,
                })
                .collect(),
            max_retries: 3,
            request_timeout_ms: 2_000,
            base_backoff_secs: 1.0,
            max_backoff_secs: 60.0,
        }
    }

    fn rpc_result(value: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": value,
        }))
    }

    #[test]
    fn test_zero_providers_is_fatal() {
        let config = pool_config(vec![]);
        assert!(matches!(RpcPool::new(config), Err(PoolError::NoProviders)));
    }

    #[test]
    fn test_weighted_selection_ratio() {
        let config = pool_config(vec![
            ("Heavy", "http://localhost:1".into(), 3.0),
            ("Light", "http://localhost:2".into(), 1.0),
        ]);
        let pool = RpcPool::new(config).unwrap();

        let mut heavy = 0usize;
        let trials = 2_000;
        for _ in 0..trials {
            if pool.select_provider(&HashSet::new()) == Some(0) {
                heavy += 1;
            }
        }

        // Expect ~75% with generous statistical tolerance
        let share = heavy as f64 / trials as f64;
        assert!(share > 0.65 && share < 0.85, "weight-3 share was {share}");
    }

    #[test]
    fn test_selection_skips_tried_providers() {
        let config = pool_config(vec![
            ("A", "http://localhost:1".into(), 1.0),
            ("B", "http://localhost:2".into(), 1.0),
        ]);
        let pool = RpcPool::new(config).unwrap();

        let mut tried = HashSet::new();
        tried.insert(0);
        assert_eq!(pool.select_provider(&tried), Some(1));
        tried.insert(1);
        assert_eq!(pool.select_provider(&tried), None);
    }

    #[test]
    fn test_switch_rotates_ring() {
        let config = pool_config(vec![
            ("A", "http://localhost:1".into(), 1.0),
            ("B", "http://localhost:2".into(), 1.0),
        ]);
        let pool = RpcPool::new(config).unwrap();

        assert_eq!(pool.active().name, "A");
        pool.switch("test");
        assert_eq!(pool.active().name, "B");
        pool.switch("test");
        assert_eq!(pool.active().name, "A");
    }

    #[tokio::test]
    async fn test_call_returns_result_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!({"value": 42})))
            .mount(&server)
            .await;

        let pool = RpcPool::new(pool_config(vec![("Mock", server.uri(), 1.0)])).unwrap();
        let result = pool.call("getBalance", json!(["abc"])).await.unwrap();
        assert_eq!(result["value"], 42);
        assert_eq!(pool.stats().providers[0].success_count, 1);
    }

    #[tokio::test]
    async fn test_429_fails_over_to_next_provider() {
        let limited = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&limited)
            .await;

        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!("ok")))
            .mount(&healthy)
            .await;

        // Weight forces the rate-limited provider to be drawn first
        let pool = RpcPool::new(pool_config(vec![
            ("Limited", limited.uri(), 1e9),
            ("Healthy", healthy.uri(), 1e-3),
        ]))
        .unwrap();

        let result = pool.call("getHealth", json!([])).await.unwrap();
        assert_eq!(result, json!("ok"));

        let stats = pool.stats();
        let limited_snap = stats.providers.iter().find(|p| p.name == "Limited").unwrap();
        assert_eq!(limited_snap.status, crate::ProviderStatus::RateLimited);
        assert!(limited_snap.backoff_until > now_ts());
    }

    #[tokio::test]
    async fn test_rate_limit_in_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32005, "message": "Rate limit exceeded"},
            })))
            .mount(&server)
            .await;

        let pool = RpcPool::new(pool_config(vec![("Mock", server.uri(), 1.0)])).unwrap();
        let err = pool.call("getHealth", json!([])).await.unwrap_err();
        assert!(matches!(err, PoolError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let pool = RpcPool::new(pool_config(vec![("Mock", server.uri(), 1.0)])).unwrap();
        let err = pool.call("getHealth", json!([])).await.unwrap_err();
        assert!(matches!(err, PoolError::NetworkError { .. }));
    }

    #[tokio::test]
    async fn test_missing_result_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1})))
            .mount(&server)
            .await;

        let pool = RpcPool::new(pool_config(vec![("Mock", server.uri(), 1.0)])).unwrap();
        let err = pool.call("getHealth", json!([])).await.unwrap_err();
        assert!(matches!(err, PoolError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_benchmark_selects_lowest_latency() {
        let mut servers = Vec::new();
        for delay_ms in [100u64, 10, 50] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(
                    rpc_result(json!("ok")).set_delay(Duration::from_millis(delay_ms)),
                )
                .mount(&server)
                .await;
            servers.push(server);
        }

        let pool = RpcPool::new(pool_config(vec![
            ("Slow", servers[0].uri(), 1.0),
            ("Fast", servers[1].uri(), 1.0),
            ("Mid", servers[2].uri(), 1.0),
        ]))
        .unwrap();

        let report = pool.benchmark().await;
        assert_eq!(report.len(), 3);
        assert_eq!(pool.active().name, "Fast");
    }

    #[tokio::test]
    async fn test_connection_error_rotates_active() {
        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!("ok")))
            .mount(&healthy)
            .await;

        // Port 1 refuses connections
        let pool = RpcPool::new(pool_config(vec![
            ("Dead", "http://127.0.0.1:1".into(), 1e9),
            ("Healthy", healthy.uri(), 1e-3),
        ]))
        .unwrap();
        assert_eq!(pool.active().name, "Dead");

        let result = pool.call("getHealth", json!([])).await.unwrap();
        assert_eq!(result, json!("ok"));
        // Hard network failure forced the pointer off the dead endpoint
        assert_eq!(pool.active().name, "Healthy");
    }
}
