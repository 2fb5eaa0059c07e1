//! Hybrid query coordinator.
//!
//! Single entry point for relay queries: picks a strategy from per-relay
//! history, falls back to the other strategy and then to the emergency path,
//! caches non-empty results for a short TTL, and fans out over many relays in
//! small concurrent batches.
//!
//! One coordinator is created at startup and cloned into every consumer; all
//! clones share metrics, cache and connection pool. Tests build a fresh one.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    cache::{QueryCache, DEFAULT_TTL},
    error::{QueryError, Result},
    event::{Event, EventDeduper},
    filter::Filter,
    metrics::{MetricsBook, RelayPerformanceMetrics},
    pool::{lock, PoolConfig},
    query::{MultiRelayResult, QueryMethod, QueryOptions, QueryResult},
    strategy::{fallback_plan, select_strategy, Strategy},
    transport::{NetworkTransport, RelayTransport},
};

/// Coordinator tuning. Defaults are tuned for constrained mobile links.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Path appended to a relay's HTTP origin for HTTP queries.
    pub http_query_path: String,
    pub http_timeout: Duration,
    pub ws_timeout: Duration,
    /// Hard deadline for the direct emergency query.
    pub emergency_timeout: Duration,
    /// Extra time a strategy gets for teardown before the coordinator gives up
    /// on it.
    pub timeout_grace: Duration,
    /// Limits above this trigger the reduced-limit emergency retry.
    pub emergency_limit_threshold: u32,
    pub emergency_reduced_limit: u32,
    pub cache_ttl: Duration,
    /// Relays queried concurrently in one fan-out batch.
    pub batch_size: usize,
    /// Pause between fan-out batches.
    pub batch_delay: Duration,
    pub pool: PoolConfig,
    pub tor_socks: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            http_query_path: "/query".into(),
            http_timeout: Duration::from_secs(5),
            ws_timeout: Duration::from_secs(8),
            emergency_timeout: Duration::from_secs(5),
            timeout_grace: Duration::from_secs(2),
            emergency_limit_threshold: 50,
            emergency_reduced_limit: 20,
            cache_ttl: DEFAULT_TTL,
            batch_size: 3,
            batch_delay: Duration::from_millis(200),
            pool: PoolConfig::default(),
            tor_socks: None,
        }
    }
}

struct Inner {
    config: CoordinatorConfig,
    transport: Arc<dyn RelayTransport>,
    metrics: Mutex<MetricsBook>,
    cache: Mutex<QueryCache>,
}

/// Shared query coordinator. Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct HybridQueryCoordinator {
    inner: Arc<Inner>,
}

impl HybridQueryCoordinator {
    /// Coordinator over the real network transport.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let transport =
            NetworkTransport::new(&config.http_query_path, config.pool.clone(), config.tor_socks.clone())?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: CoordinatorConfig, transport: Arc<dyn RelayTransport>) -> Self {
        let cache = QueryCache::new(config.cache_ttl);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                metrics: Mutex::new(MetricsBook::default()),
                cache: Mutex::new(cache),
            }),
        }
    }

    /// Query one relay, degrading through cache, preferred strategy, alternate
    /// strategy and emergency path. Never fails: every outcome is an envelope.
    pub async fn query_relay(&self, relay: &str, filter: &Filter, options: &QueryOptions) -> QueryResult {
        let started = Instant::now();
        let primary = {
            let metrics = lock(&self.inner.metrics);
            select_strategy(metrics.get(relay), options.force_method)
        };
        let filter = options.apply(filter);

        if let Err(e) = validate_relay_url(relay).and_then(|()| filter.validate()) {
            warn!(relay, error = %e, "rejecting query");
            return QueryResult::failed(relay, primary.into(), e.to_string(), started.elapsed());
        }

        if !options.skip_cache {
            let cached = lock(&self.inner.cache).get(relay, &filter);
            if let Some(events) = cached {
                debug!(relay, count = events.len(), "cache hit");
                return QueryResult::completed(relay, QueryMethod::Cache, events, started.elapsed());
            }
        }

        let plan = self.run_plan(relay, &filter, options, primary, started);
        match options.budget {
            Some(budget) => match tokio::time::timeout(budget, plan).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(relay, ?budget, "relay query budget exhausted");
                    QueryResult::failed(
                        relay,
                        primary.into(),
                        QueryError::Timeout(budget).to_string(),
                        started.elapsed(),
                    )
                }
            },
            None => plan.await,
        }
    }

    /// Walk the fallback plan until a strategy answers.
    async fn run_plan(
        &self,
        relay: &str,
        filter: &Filter,
        options: &QueryOptions,
        primary: Strategy,
        started: Instant,
    ) -> QueryResult {
        let mut fallbacks = Vec::new();
        let mut last_error = String::from("no strategy attempted");
        for strategy in fallback_plan(primary) {
            if strategy == Strategy::Emergency {
                if let Some(events) = self
                    .emergency(relay, filter, &mut fallbacks, &mut last_error)
                    .await
                {
                    return QueryResult::completed(relay, QueryMethod::Emergency, events, started.elapsed())
                        .with_fallbacks(fallbacks);
                }
                continue;
            }

            fallbacks.push(format!("{strategy}_attempt"));
            let timeout = options.timeout.unwrap_or_else(|| self.timeout_for(strategy));
            let attempt = Instant::now();
            match self.run(strategy, relay, filter, timeout).await {
                Ok(events) => {
                    self.record(relay, strategy, true, attempt.elapsed(), events.len());
                    lock(&self.inner.cache).put(relay, filter, &events);
                    debug!(relay, %strategy, count = events.len(), "query succeeded");
                    return QueryResult::completed(relay, strategy.into(), events, started.elapsed())
                        .with_fallbacks(fallbacks);
                }
                Err(e) => {
                    self.record(relay, strategy, false, attempt.elapsed(), 0);
                    fallbacks.push(format!("{strategy}_failed"));
                    warn!(relay, %strategy, error = %e, "strategy failed");
                    last_error = e.to_string();
                }
            }
        }

        warn!(relay, fallbacks = ?fallbacks, "all strategies exhausted");
        QueryResult::failed(
            relay,
            primary.into(),
            format!("all strategies failed: {last_error}"),
            started.elapsed(),
        )
        .with_fallbacks(fallbacks)
    }

    /// Query many relays in concurrent batches and merge their events.
    ///
    /// Within a batch every relay runs to completion regardless of the others;
    /// results are recorded in input order and events deduplicated by id.
    pub async fn query_multiple_relays(
        &self,
        relays: &[String],
        filter: &Filter,
        options: &QueryOptions,
    ) -> MultiRelayResult {
        let batch_size = self.inner.config.batch_size.max(1);
        let mut relay_results = Vec::with_capacity(relays.len());
        let mut dedup = EventDeduper::new();
        let mut events = Vec::new();

        for (i, batch) in relays.chunks(batch_size).enumerate() {
            if i > 0 && !self.inner.config.batch_delay.is_zero() {
                tokio::time::sleep(self.inner.config.batch_delay).await;
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|relay| self.query_relay(relay, filter, options)),
            )
            .await;
            for result in results {
                dedup.extend_unique(&mut events, result.events.iter().cloned());
                relay_results.push(result);
            }
        }

        let successful_relays = relay_results.iter().filter(|r| r.success).count();
        info!(
            relays = relays.len(),
            successful_relays,
            events = events.len(),
            "multi-relay query finished"
        );
        MultiRelayResult {
            total_events_found: events.len(),
            events,
            relay_results,
            successful_relays,
        }
    }

    /// Snapshot of per-relay performance.
    pub fn performance_metrics(&self) -> HashMap<String, RelayPerformanceMetrics> {
        lock(&self.inner.metrics).snapshot()
    }

    pub fn relay_metrics(&self, relay: &str) -> Option<RelayPerformanceMetrics> {
        lock(&self.inner.metrics).get(relay).cloned()
    }

    /// Relays ranked by success rate, event volume and latency.
    pub fn best_performing_relays(&self, limit: usize) -> Vec<String> {
        lock(&self.inner.metrics).best(limit)
    }

    pub fn clear_cache(&self) {
        lock(&self.inner.cache).clear();
    }

    pub fn clear_metrics(&self) {
        lock(&self.inner.metrics).clear();
    }

    pub fn cached_entries(&self) -> usize {
        lock(&self.inner.cache).len()
    }

    /// Reset cache and metrics and release pooled connections.
    pub async fn cleanup(&self) {
        self.clear_cache();
        self.clear_metrics();
        self.inner.transport.shutdown().await;
    }

    /// Degraded path, stopping at the first attempt that yields events:
    /// a WebSocket retry with a reduced limit when the limit is large, then a
    /// direct query on a fresh connection.
    async fn emergency(
        &self,
        relay: &str,
        filter: &Filter,
        fallbacks: &mut Vec<String>,
        last_error: &mut String,
    ) -> Option<Vec<Event>> {
        let cfg = &self.inner.config;
        if filter.limit.is_some_and(|l| l > cfg.emergency_limit_threshold) {
            fallbacks.push("emergency_reduced_limit".into());
            let mut reduced = filter.clone();
            reduced.limit = Some(cfg.emergency_reduced_limit);
            let attempt = Instant::now();
            match self.run(Strategy::WebSocket, relay, &reduced, cfg.ws_timeout).await {
                Ok(events) if !events.is_empty() => {
                    self.record(relay, Strategy::Emergency, true, attempt.elapsed(), events.len());
                    return Some(events);
                }
                Ok(_) => *last_error = "reduced-limit retry returned no events".into(),
                Err(e) => *last_error = e.to_string(),
            }
            self.record(relay, Strategy::Emergency, false, attempt.elapsed(), 0);
            fallbacks.push("emergency_reduced_limit_failed".into());
        }

        fallbacks.push("emergency_direct".into());
        let attempt = Instant::now();
        match self
            .run(Strategy::Emergency, relay, filter, cfg.emergency_timeout)
            .await
        {
            Ok(events) if !events.is_empty() => {
                self.record(relay, Strategy::Emergency, true, attempt.elapsed(), events.len());
                return Some(events);
            }
            Ok(_) => *last_error = "direct query returned no events".into(),
            Err(e) => *last_error = e.to_string(),
        }
        self.record(relay, Strategy::Emergency, false, attempt.elapsed(), 0);
        fallbacks.push("emergency_direct_failed".into());
        None
    }

    /// One transport call, bounded by `timeout` plus teardown grace.
    async fn run(&self, strategy: Strategy, relay: &str, filter: &Filter, timeout: Duration) -> Result<Vec<Event>> {
        let transport = &self.inner.transport;
        let call = async {
            match strategy {
                Strategy::Http => transport.http_query(relay, filter, timeout).await,
                Strategy::WebSocket => transport.ws_query(relay, filter, timeout).await,
                Strategy::Emergency => transport.direct_query(relay, filter, timeout).await,
            }
        };
        tokio::time::timeout(timeout + self.inner.config.timeout_grace, call)
            .await
            .map_err(|_| QueryError::Timeout(timeout))?
    }

    fn timeout_for(&self, strategy: Strategy) -> Duration {
        match strategy {
            Strategy::Http => self.inner.config.http_timeout,
            Strategy::WebSocket => self.inner.config.ws_timeout,
            Strategy::Emergency => self.inner.config.emergency_timeout,
        }
    }

    /// Metric updates happen in one synchronous call per attempt.
    fn record(&self, relay: &str, strategy: Strategy, success: bool, elapsed: Duration, events: usize) {
        lock(&self.inner.metrics).record(relay, strategy, success, elapsed, events);
    }
}

/// Relay URLs must be absolute `ws`, `wss`, `http` or `https` URLs with a host.
pub fn validate_relay_url(relay: &str) -> Result<()> {
    let url = Url::parse(relay).map_err(|e| QueryError::InvalidRelayUrl(format!("{relay}: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") || url.host_str().is_none() {
        return Err(QueryError::InvalidRelayUrl(relay.to_string()));
    }
    Ok(())
}
