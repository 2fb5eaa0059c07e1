//! HTTP query strategy: one POST per query, filter in the body.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{
    error::{QueryError, Result},
    event::Event,
    filter::Filter,
};

/// Issues single-shot HTTP queries against a relay's HTTP endpoint.
#[derive(Clone)]
pub struct HttpStrategy {
    client: reqwest::Client,
    query_path: String,
}

impl HttpStrategy {
    pub fn new(query_path: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relayq/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            query_path: query_path.into(),
        })
    }

    /// POST `filter` to the relay's HTTP endpoint and parse the event list.
    ///
    /// The request races `timeout`; there are no retries here.
    pub async fn query(&self, relay: &str, filter: &Filter, timeout: Duration) -> Result<Vec<Event>> {
        let endpoint = http_endpoint(relay, &self.query_path)?;
        debug!(%endpoint, "http query");
        let request = async {
            let resp = self
                .client
                .post(endpoint.clone())
                .json(&filter.to_json())
                .timeout(timeout)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(QueryError::HttpStatus(status.as_u16()));
            }
            let body = resp.text().await?;
            parse_events(&body)
        };
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| QueryError::Timeout(timeout))?
    }
}

/// Map a relay URL to its HTTP query endpoint: `wss` becomes `https`, `ws`
/// becomes `http`, and `query_path` is appended to the relay's path.
pub fn http_endpoint(relay: &str, query_path: &str) -> Result<Url> {
    let mut url = Url::parse(relay)?;
    let scheme = match url.scheme() {
        "wss" | "https" => "https",
        "ws" | "http" => "http",
        _ => return Err(QueryError::InvalidRelayUrl(relay.to_string())),
    };
    if url.host_str().is_none() {
        return Err(QueryError::InvalidRelayUrl(relay.to_string()));
    }
    url.set_scheme(scheme)
        .map_err(|_| QueryError::InvalidRelayUrl(relay.to_string()))?;
    let base = url.path().trim_end_matches('/').to_string();
    let suffix = query_path.trim_start_matches('/');
    if suffix.is_empty() {
        url.set_path(if base.is_empty() { "/" } else { &base });
    } else {
        url.set_path(&format!("{base}/{suffix}"));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Parse an HTTP response body into events.
///
/// Accepts a JSON array, an object with an `events` array, or newline-delimited
/// JSON. Array entries that are not events are skipped; a body that is not
/// JSON at all is malformed. An empty body is an empty result.
pub fn parse_events(body: &str) -> Result<Vec<Event>> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if let Ok(val) = serde_json::from_str::<Value>(trimmed) {
        let items = match val {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("events") {
                Some(Value::Array(items)) => items,
                // A single event object is a one-line NDJSON body.
                _ => return Ok(vec![serde_json::from_value(Value::Object(obj))?]),
            },
            _ => return Err(QueryError::Malformed("expected an event list".into())),
        };
        return Ok(items
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Event>(v).ok())
            .collect());
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Event>(line).map_err(QueryError::from))
        .collect()
}
