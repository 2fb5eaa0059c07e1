//! Per-relay performance tracking used for strategy selection and ranking.

use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::strategy::Strategy;

/// Running counters for one relay.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RelayPerformanceMetrics {
    pub relay: String,
    pub http_success: u64,
    pub http_failure: u64,
    pub websocket_success: u64,
    pub websocket_failure: u64,
    /// Emergency attempts are tracked apart and do not affect the average
    /// response time or the preferred method.
    pub emergency_success: u64,
    pub emergency_failure: u64,
    /// Running average over HTTP and WebSocket attempts, in milliseconds.
    pub avg_response_time_ms: f64,
    pub total_events: u64,
    /// Unix seconds of the most recent successful attempt.
    pub last_success: Option<u64>,
    pub preferred_method: Strategy,
}

impl RelayPerformanceMetrics {
    pub fn new(relay: &str) -> Self {
        Self {
            relay: relay.to_string(),
            http_success: 0,
            http_failure: 0,
            websocket_success: 0,
            websocket_failure: 0,
            emergency_success: 0,
            emergency_failure: 0,
            avg_response_time_ms: 0.0,
            total_events: 0,
            last_success: None,
            preferred_method: Strategy::Http,
        }
    }

    /// Fold one finished attempt into the counters.
    pub fn record(&mut self, strategy: Strategy, success: bool, elapsed: Duration, events: usize) {
        let counter = match (strategy, success) {
            (Strategy::Http, true) => &mut self.http_success,
            (Strategy::Http, false) => &mut self.http_failure,
            (Strategy::WebSocket, true) => &mut self.websocket_success,
            (Strategy::WebSocket, false) => &mut self.websocket_failure,
            (Strategy::Emergency, true) => &mut self.emergency_success,
            (Strategy::Emergency, false) => &mut self.emergency_failure,
        };
        *counter += 1;
        if success {
            self.total_events += events as u64;
            self.last_success = Some(unix_now());
        }
        if strategy != Strategy::Emergency {
            let n = self.primary_attempts() as f64;
            let t = elapsed.as_secs_f64() * 1000.0;
            self.avg_response_time_ms = (self.avg_response_time_ms * (n - 1.0) + t) / n;
        }
        self.preferred_method = self.compute_preferred();
    }

    /// Attempts across HTTP and WebSocket.
    pub fn primary_attempts(&self) -> u64 {
        self.http_success + self.http_failure + self.websocket_success + self.websocket_failure
    }

    /// Successes / attempts for one strategy, zero without attempts.
    pub fn success_rate(&self, strategy: Strategy) -> f64 {
        let (ok, failed) = match strategy {
            Strategy::Http => (self.http_success, self.http_failure),
            Strategy::WebSocket => (self.websocket_success, self.websocket_failure),
            Strategy::Emergency => (self.emergency_success, self.emergency_failure),
        };
        ratio(ok, ok + failed)
    }

    /// Composite ranking score in `[0, 1]`: success rate weighs most, then
    /// event volume (saturating at 100 events), then inverse latency.
    pub fn score(&self) -> f64 {
        let attempts = self.primary_attempts();
        if attempts == 0 {
            return 0.0;
        }
        let success = ratio(self.http_success + self.websocket_success, attempts);
        let volume = (self.total_events.min(100) as f64) / 100.0;
        let latency = 1000.0 / (1000.0 + self.avg_response_time_ms.max(0.0));
        success * 0.5 + volume * 0.3 + latency * 0.2
    }

    fn compute_preferred(&self) -> Strategy {
        if self.success_rate(Strategy::WebSocket) > self.success_rate(Strategy::Http) {
            Strategy::WebSocket
        } else {
            Strategy::Http
        }
    }
}

/// Metrics for every relay queried so far.
#[derive(Debug, Default)]
pub struct MetricsBook {
    relays: HashMap<String, RelayPerformanceMetrics>,
}

impl MetricsBook {
    pub fn get(&self, relay: &str) -> Option<&RelayPerformanceMetrics> {
        self.relays.get(relay)
    }

    /// Record an attempt, creating the relay's entry on first use.
    pub fn record(
        &mut self,
        relay: &str,
        strategy: Strategy,
        success: bool,
        elapsed: Duration,
        events: usize,
    ) {
        self.relays
            .entry(relay.to_string())
            .or_insert_with(|| RelayPerformanceMetrics::new(relay))
            .record(strategy, success, elapsed, events);
    }

    pub fn snapshot(&self) -> HashMap<String, RelayPerformanceMetrics> {
        self.relays.clone()
    }

    /// Relays with at least one attempt, best score first.
    pub fn best(&self, limit: usize) -> Vec<String> {
        let mut ranked: Vec<(&String, f64)> = self
            .relays
            .iter()
            .filter(|(_, m)| m.primary_attempts() > 0)
            .map(|(url, m)| (url, m.score()))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(limit)
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.relays.clear();
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
