//! Strategy selection for relay queries.
//!
//! Selection is a pure function of the relay's recorded performance and the
//! caller's override, so it can be tested without any transport.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::metrics::RelayPerformanceMetrics;

/// Transport-level technique used to run a query against a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// One-shot HTTP POST of the filter.
    #[serde(rename = "http")]
    Http,
    /// Subscription over a pooled WebSocket connection.
    #[serde(rename = "websocket")]
    WebSocket,
    /// Degraded path: reduced-limit retry, then a fresh unpooled connection.
    #[serde(rename = "emergency")]
    Emergency,
}

impl Strategy {
    pub fn name(self) -> &'static str {
        match self {
            Strategy::Http => "http",
            Strategy::WebSocket => "websocket",
            Strategy::Emergency => "emergency",
        }
    }

    /// The alternate primary strategy. Emergency has no alternate.
    pub fn alternate(self) -> Option<Strategy> {
        match self {
            Strategy::Http => Some(Strategy::WebSocket),
            Strategy::WebSocket => Some(Strategy::Http),
            Strategy::Emergency => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Strategy::Http),
            "websocket" | "ws" | "wss" => Ok(Strategy::WebSocket),
            "emergency" | "direct" => Ok(Strategy::Emergency),
            other => Err(format!("unknown method {other:?}")),
        }
    }
}

/// Pick the strategy to try first.
///
/// An explicit override wins. Otherwise the relay's preferred method is used,
/// and relays without history start with HTTP since a single round trip beats
/// a WebSocket handshake on slow mobile links.
pub fn select_strategy(
    metrics: Option<&RelayPerformanceMetrics>,
    force: Option<Strategy>,
) -> Strategy {
    if let Some(strategy) = force {
        return strategy;
    }
    metrics.map_or(Strategy::Http, |m| m.preferred_method)
}

/// Strategies to try, strictly in order, for a given primary.
pub fn fallback_plan(primary: Strategy) -> Vec<Strategy> {
    match primary.alternate() {
        Some(alt) => vec![primary, alt, Strategy::Emergency],
        None => vec![Strategy::Emergency],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_http_without_history() {
        assert_eq!(select_strategy(None, None), Strategy::Http);
    }

    #[test]
    fn override_wins_over_metrics() {
        let mut m = RelayPerformanceMetrics::new("wss://r");
        m.preferred_method = Strategy::WebSocket;
        assert_eq!(select_strategy(Some(&m), None), Strategy::WebSocket);
        assert_eq!(select_strategy(Some(&m), Some(Strategy::Http)), Strategy::Http);
        assert_eq!(
            select_strategy(None, Some(Strategy::Emergency)),
            Strategy::Emergency
        );
    }

    #[test]
    fn plans_are_ordered() {
        assert_eq!(
            fallback_plan(Strategy::Http),
            vec![Strategy::Http, Strategy::WebSocket, Strategy::Emergency]
        );
        assert_eq!(
            fallback_plan(Strategy::WebSocket),
            vec![Strategy::WebSocket, Strategy::Http, Strategy::Emergency]
        );
        assert_eq!(fallback_plan(Strategy::Emergency), vec![Strategy::Emergency]);
    }

    #[test]
    fn parses_names() {
        assert_eq!("HTTP".parse::<Strategy>().unwrap(), Strategy::Http);
        assert_eq!("ws".parse::<Strategy>().unwrap(), Strategy::WebSocket);
        assert_eq!("direct".parse::<Strategy>().unwrap(), Strategy::Emergency);
        assert!("carrier-pigeon".parse::<Strategy>().is_err());
    }
}
