//! Configuration loading from `.env` files.

use std::{env, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

use crate::{coordinator::CoordinatorConfig, team::TeamDiscoveryConfig};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Ordered list of known-good relay URLs.
    pub relays: Vec<String>,
    /// Gateway bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// Path appended to a relay's HTTP origin for the HTTP strategy.
    pub http_query_path: String,
    pub http_timeout: Duration,
    pub ws_timeout: Duration,
    pub emergency_timeout: Duration,
    pub cache_ttl: Duration,
    /// Relays queried concurrently per fan-out batch.
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Event kind carrying team definitions.
    pub team_kind: u32,
    /// Pause between team discovery queries.
    pub team_query_delay: Duration,
    /// Optional SOCKS5 proxy (host:port) for WebSocket connections.
    pub tor_socks: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let coordinator = CoordinatorConfig::default();
        let team = TeamDiscoveryConfig::default();
        Self {
            relays: Vec::new(),
            bind_http: "127.0.0.1:7777".into(),
            http_query_path: coordinator.http_query_path,
            http_timeout: coordinator.http_timeout,
            ws_timeout: coordinator.ws_timeout,
            emergency_timeout: coordinator.emergency_timeout,
            cache_ttl: coordinator.cache_ttl,
            batch_size: coordinator.batch_size,
            batch_delay: coordinator.batch_delay,
            team_kind: team.kind,
            team_query_delay: team.query_delay,
            tor_socks: None,
        }
    }
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let relays = csv_strings(env::var("RELAYS").context("RELAYS not set")?);
        if relays.is_empty() {
            bail!("RELAYS must list at least one relay");
        }
        let defaults = Settings::default();
        Ok(Self {
            relays,
            bind_http: env::var("BIND_HTTP")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.bind_http),
            http_query_path: env::var("HTTP_QUERY_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.http_query_path),
            http_timeout: millis_or("HTTP_TIMEOUT_MS", defaults.http_timeout),
            ws_timeout: millis_or("WS_TIMEOUT_MS", defaults.ws_timeout),
            emergency_timeout: millis_or("EMERGENCY_TIMEOUT_MS", defaults.emergency_timeout),
            cache_ttl: parsed_or("CACHE_TTL_SECS", defaults.cache_ttl.as_secs())
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            batch_size: parsed_or("BATCH_SIZE", defaults.batch_size)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            batch_delay: millis_or("BATCH_DELAY_MS", defaults.batch_delay),
            team_kind: parsed_or("TEAM_KIND", defaults.team_kind).unwrap_or(defaults.team_kind),
            team_query_delay: millis_or("TEAM_QUERY_DELAY_MS", defaults.team_query_delay),
            tor_socks: env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty()),
        })
    }

    /// Coordinator tuning derived from these settings.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            http_query_path: self.http_query_path.clone(),
            http_timeout: self.http_timeout,
            ws_timeout: self.ws_timeout,
            emergency_timeout: self.emergency_timeout,
            cache_ttl: self.cache_ttl,
            batch_size: self.batch_size,
            batch_delay: self.batch_delay,
            tor_socks: self.tor_socks.clone(),
            ..CoordinatorConfig::default()
        }
    }

    /// Team discovery tuning over the configured relays.
    pub fn team_config(&self) -> TeamDiscoveryConfig {
        TeamDiscoveryConfig {
            kind: self.team_kind,
            relays: self.relays.clone(),
            query_delay: self.team_query_delay,
            ..TeamDiscoveryConfig::default()
        }
    }
}

/// Parse a variable, `None` when unset. Unparsable values fall back to `default`.
fn parsed_or<T: FromStr>(key: &str, default: T) -> Option<T> {
    let raw = env::var(key).ok().filter(|s| !s.trim().is_empty())?;
    Some(raw.trim().parse().unwrap_or(default))
}

fn millis_or(key: &str, default: Duration) -> Duration {
    parsed_or(key, default.as_millis() as u64)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
