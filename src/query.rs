//! Query options and result envelopes shared by every strategy.

use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::{event::Event, filter::Filter, strategy::Strategy};

/// How the events in a [`QueryResult`] were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMethod {
    Http,
    Websocket,
    Emergency,
    Cache,
}

impl QueryMethod {
    pub fn name(self) -> &'static str {
        match self {
            QueryMethod::Http => "http",
            QueryMethod::Websocket => "websocket",
            QueryMethod::Emergency => "emergency",
            QueryMethod::Cache => "cache",
        }
    }
}

impl From<Strategy> for QueryMethod {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::Http => QueryMethod::Http,
            Strategy::WebSocket => QueryMethod::Websocket,
            Strategy::Emergency => QueryMethod::Emergency,
        }
    }
}

/// Per-call options. `limit`, `since` and `until` override the filter.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<u32>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    /// Per-strategy timeout; the coordinator's configured default otherwise.
    pub timeout: Option<Duration>,
    /// Skip performance-based selection and start with this strategy.
    pub force_method: Option<Strategy>,
    /// Ignore cached results for this call.
    pub skip_cache: bool,
    /// Overall time for one relay across all strategies. On expiry the relay
    /// reports a timeout; other relays in a fan-out are unaffected.
    pub budget: Option<Duration>,
}

impl QueryOptions {
    /// The filter actually sent to relays.
    pub fn apply(&self, filter: &Filter) -> Filter {
        let mut f = filter.clone();
        if let Some(limit) = self.limit {
            f.limit = Some(limit);
        }
        if let Some(since) = self.since {
            f.since = Some(since);
        }
        if let Some(until) = self.until {
            f.until = Some(until);
        }
        f
    }
}

/// Uniform envelope returned for a query against one relay.
///
/// Built only through [`QueryResult::completed`] and [`QueryResult::failed`],
/// which keep `events_found == events.len()`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub success: bool,
    pub events: Vec<Event>,
    pub relay: String,
    pub method: QueryMethod,
    #[serde(rename = "response_time_ms", serialize_with = "as_millis")]
    pub response_time: Duration,
    pub events_found: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallbacks_used: Vec<String>,
}

impl QueryResult {
    /// A strategy ran to completion; `events` may legitimately be empty.
    pub fn completed(
        relay: &str,
        method: QueryMethod,
        events: Vec<Event>,
        response_time: Duration,
    ) -> Self {
        Self {
            success: true,
            events_found: events.len(),
            events,
            relay: relay.to_string(),
            method,
            response_time,
            error: None,
            fallbacks_used: Vec::new(),
        }
    }

    pub fn failed(
        relay: &str,
        method: QueryMethod,
        error: impl Into<String>,
        response_time: Duration,
    ) -> Self {
        Self {
            success: false,
            events: Vec::new(),
            events_found: 0,
            relay: relay.to_string(),
            method,
            response_time,
            error: Some(error.into()),
            fallbacks_used: Vec::new(),
        }
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks_used = fallbacks;
        self
    }
}

/// Outcome of a fan-out over several relays.
#[derive(Debug, Clone, Serialize)]
pub struct MultiRelayResult {
    /// Union of all relay results, deduplicated by id in first-seen order.
    pub events: Vec<Event>,
    /// One envelope per requested relay, in the order relays were given.
    pub relay_results: Vec<QueryResult>,
    pub total_events_found: usize,
    pub successful_relays: usize,
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
