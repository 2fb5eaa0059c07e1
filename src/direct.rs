//! Direct query on a brand-new, unpooled connection.
//!
//! Last-resort path for relays where both primary strategies failed: it
//! ignores any pool state, uses a simplified filter and a hard deadline, and
//! returns whatever events arrived. The connection is always closed.

use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::{
    error::{QueryError, Result},
    event::Event,
    filter::Filter,
    pool::CLOSE_GRACE,
    ws::{close_subscription, collect_until_eose, connect_ws, send_req, subscription_id, Termination},
};

/// Limit cap applied to the simplified filter.
pub const DIRECT_LIMIT_CAP: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct DirectQuery {
    tor_socks: Option<String>,
}

impl DirectQuery {
    pub fn new(tor_socks: Option<String>) -> Self {
        Self { tor_socks }
    }

    /// Run `filter` (simplified) on a fresh connection to `relay`.
    ///
    /// Errors only when nothing at all arrived; a partial result wins over a
    /// precise error on this path.
    pub async fn query(&self, relay: &str, filter: &Filter, timeout: Duration) -> Result<Vec<Event>> {
        let deadline = Instant::now() + timeout;
        let filter = filter.simplified(DIRECT_LIMIT_CAP);
        let mut ws = timeout_at(deadline, connect_ws(relay, self.tor_socks.as_deref()))
            .await
            .map_err(|_| QueryError::Timeout(timeout))??;
        let sub_id = subscription_id(relay);

        let outcome = match send_req(&mut ws, &sub_id, &filter).await {
            Ok(()) => {
                let collection = collect_until_eose(&mut ws, &sub_id, deadline).await;
                debug!(relay, termination = ?collection.termination, count = collection.events.len(), "direct query finished");
                Ok(collection)
            }
            Err(e) => Err(e),
        };

        // Teardown runs on every path.
        close_subscription(&mut ws, &sub_id).await;
        let _ = tokio::time::timeout(CLOSE_GRACE, ws.close(None)).await;

        let collection = outcome?;
        if !collection.events.is_empty() {
            return Ok(collection.events);
        }
        match collection.termination {
            Termination::Eose => Ok(Vec::new()),
            Termination::TimedOut => Err(QueryError::Timeout(timeout)),
            Termination::Closed(reason) => Err(QueryError::Closed(reason)),
            Termination::Disconnected(reason) => {
                warn!(relay, %reason, "direct query lost connection");
                Err(QueryError::Connection(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::sample_event;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    /// Relay that sends `events` for the first REQ, optionally EOSE, then
    /// reports every frame it sees and whether the client closed the socket.
    async fn spawn_relay(
        events: Vec<Event>,
        send_eose: bool,
    ) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(TMsg::Text(txt)) => {
                        let _ = tx.send(txt.clone());
                        let val: Value = serde_json::from_str(&txt).unwrap();
                        if val[0] == "REQ" {
                            for ev in &events {
                                let frame = serde_json::json!(["EVENT", val[1], ev]);
                                ws.send(TMsg::Text(frame.to_string())).await.unwrap();
                            }
                            if send_eose {
                                let eose = serde_json::json!(["EOSE", val[1]]);
                                ws.send(TMsg::Text(eose.to_string())).await.unwrap();
                            }
                        }
                    }
                    Ok(TMsg::Close(_)) => {
                        let _ = tx.send("closed".into());
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
        (format!("ws://{}", addr), rx)
    }

    #[tokio::test]
    async fn sends_simplified_filter_and_always_closes() {
        let (url, mut frames) = spawn_relay(vec![sample_event("e1", 1, 1)], true).await;
        let filter = Filter::new().kinds([1]).tag('t', ["running"]).limit(500);
        let events = DirectQuery::default()
            .query(&url, &filter, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        let req = frames.recv().await.unwrap();
        assert!(!req.contains("#t"));
        assert!(req.contains(&format!("\"limit\":{DIRECT_LIMIT_CAP}")));
        assert!(frames.recv().await.unwrap().starts_with("[\"CLOSE\""));
        assert_eq!(frames.recv().await.unwrap(), "closed");
    }

    #[tokio::test]
    async fn keeps_partial_events_on_timeout() {
        let (url, mut frames) = spawn_relay(vec![sample_event("e1", 1, 1)], false).await;
        let events = DirectQuery::default()
            .query(&url, &Filter::new().kinds([1]), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let _req = frames.recv().await.unwrap();
        let _close_sub = frames.recv().await.unwrap();
        assert_eq!(frames.recv().await.unwrap(), "closed");
    }

    #[tokio::test]
    async fn timeout_without_events_is_an_error() {
        let (url, _frames) = spawn_relay(vec![], false).await;
        let err = DirectQuery::default()
            .query(&url, &Filter::new().kinds([1]), Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Timeout(_)));
    }

    #[tokio::test]
    async fn empty_eose_is_an_empty_result() {
        let (url, _frames) = spawn_relay(vec![], true).await;
        let events = DirectQuery::default()
            .query(&url, &Filter::new().kinds([1]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn unreachable_relay_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(DirectQuery::default()
            .query(&format!("ws://{addr}"), &Filter::new(), Duration::from_secs(2))
            .await
            .is_err());
    }
}
