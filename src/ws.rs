//! WebSocket query strategy: NIP-01 `REQ` over a pooled connection, collecting
//! `EVENT`s until `EOSE`.

use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use rand::{thread_rng, Rng};
use serde_json::Value;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{QueryError, Result},
    event::{Event, EventDeduper},
    filter::Filter,
    pool::{ConnectionPool, PooledConnection, CLOSE_GRACE},
};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Runs one subscription per query on connections borrowed from a pool.
pub struct WebSocketStrategy {
    pool: Arc<ConnectionPool>,
}

impl WebSocketStrategy {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Query `relay` and return the events received before `EOSE`.
    ///
    /// A deadline covers dialing, the subscription, and collection. When it
    /// passes, whatever arrived is returned (or a timeout error if nothing
    /// did). The subscription is closed while the socket is alive; only
    /// connections that finished cleanly go back to the pool.
    pub async fn query(&self, relay: &str, filter: &Filter, timeout: Duration) -> Result<Vec<Event>> {
        let deadline = Instant::now() + timeout;
        let mut conn = timeout_at(deadline, self.pool.checkout(relay))
            .await
            .map_err(|_| QueryError::Timeout(timeout))??;
        let sub_id = subscription_id(relay);

        let mut outcome = subscribe(&mut conn, &sub_id, filter, deadline).await;
        // An idle connection may have been dropped by the relay while pooled.
        if conn.is_reused() && is_stale(&outcome) {
            debug!(relay, "stale pooled connection, redialing");
            drop(conn);
            conn = timeout_at(deadline, self.pool.connect_fresh(relay))
                .await
                .map_err(|_| QueryError::Timeout(timeout))??;
            outcome = subscribe(&mut conn, &sub_id, filter, deadline).await;
        }
        let collection = match outcome {
            Ok(collection) => collection,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };
        let Collection {
            events,
            termination,
        } = collection;
        match termination {
            Termination::Eose => {
                self.pool.checkin(conn).await;
                Ok(events)
            }
            Termination::Closed(reason) => {
                self.pool.checkin(conn).await;
                if events.is_empty() {
                    Err(QueryError::Closed(reason))
                } else {
                    Ok(events)
                }
            }
            Termination::TimedOut => {
                conn.close().await;
                if events.is_empty() {
                    Err(QueryError::Timeout(timeout))
                } else {
                    warn!(relay, count = events.len(), "no EOSE before deadline, keeping partial result");
                    Ok(events)
                }
            }
            Termination::Disconnected(reason) => {
                conn.close().await;
                if events.is_empty() {
                    Err(QueryError::Connection(reason))
                } else {
                    warn!(relay, count = events.len(), %reason, "connection lost, keeping partial result");
                    Ok(events)
                }
            }
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

/// Message received from a relay, limited to what queries care about.
#[derive(Debug, PartialEq)]
pub(crate) enum RelayMessage {
    Event { subscription: String, event: Event },
    Eose(String),
    Closed { subscription: String, message: String },
    Notice(String),
}

/// Parse a relay frame. Unknown or malformed frames yield `None`.
pub(crate) fn parse_relay_message(txt: &str) -> Option<RelayMessage> {
    let val: Value = serde_json::from_str(txt).ok()?;
    let arr = val.as_array()?;
    let text = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
    match arr.first().and_then(|v| v.as_str())? {
        "EVENT" if arr.len() >= 3 => {
            let event = serde_json::from_value::<Event>(arr[2].clone()).ok()?;
            Some(RelayMessage::Event {
                subscription: text(1)?,
                event,
            })
        }
        "EOSE" => Some(RelayMessage::Eose(text(1)?)),
        "CLOSED" => Some(RelayMessage::Closed {
            subscription: text(1)?,
            message: text(2).unwrap_or_default(),
        }),
        "NOTICE" => Some(RelayMessage::Notice(text(1).unwrap_or_default())),
        _ => None,
    }
}

/// Why collection stopped.
#[derive(Debug, PartialEq)]
pub(crate) enum Termination {
    Eose,
    Closed(String),
    Disconnected(String),
    TimedOut,
}

pub(crate) struct Collection {
    pub events: Vec<Event>,
    pub termination: Termination,
}

/// Read frames until the subscription ends or `deadline` passes. Events for
/// other subscriptions are ignored and duplicates within this one dropped.
pub(crate) async fn collect_until_eose(ws: &mut WsStream, sub_id: &str, deadline: Instant) -> Collection {
    let mut events = Vec::new();
    let mut seen = EventDeduper::new();
    loop {
        let msg = match timeout_at(deadline, ws.next()).await {
            Err(_) => {
                return Collection {
                    events,
                    termination: Termination::TimedOut,
                }
            }
            Ok(None) => {
                return Collection {
                    events,
                    termination: Termination::Disconnected("stream ended before EOSE".into()),
                }
            }
            Ok(Some(Err(e))) => {
                return Collection {
                    events,
                    termination: Termination::Disconnected(e.to_string()),
                }
            }
            Ok(Some(Ok(msg))) => msg,
        };
        match msg {
            Message::Text(txt) => match parse_relay_message(&txt) {
                Some(RelayMessage::Event {
                    subscription,
                    event,
                }) if subscription == sub_id => {
                    if seen.insert(&event.id) {
                        events.push(event);
                    }
                }
                Some(RelayMessage::Eose(subscription)) if subscription == sub_id => {
                    return Collection {
                        events,
                        termination: Termination::Eose,
                    }
                }
                Some(RelayMessage::Closed {
                    subscription,
                    message,
                }) if subscription == sub_id => {
                    return Collection {
                        events,
                        termination: Termination::Closed(message),
                    }
                }
                Some(RelayMessage::Notice(notice)) => debug!(%notice, "relay notice"),
                _ => {}
            },
            Message::Close(_) => {
                return Collection {
                    events,
                    termination: Termination::Disconnected("relay closed connection".into()),
                }
            }
            _ => {}
        }
    }
}

/// Send the REQ and collect its answer. `CLOSE` is skipped once the socket
/// is gone.
async fn subscribe(conn: &mut PooledConnection, sub_id: &str, filter: &Filter, deadline: Instant) -> Result<Collection> {
    send_req(conn.stream(), sub_id, filter).await?;
    let collection = collect_until_eose(conn.stream(), sub_id, deadline).await;
    if !matches!(collection.termination, Termination::Disconnected(_)) {
        close_subscription(conn.stream(), sub_id).await;
    }
    Ok(collection)
}

/// True when nothing came back because the connection was already dead.
fn is_stale(outcome: &Result<Collection>) -> bool {
    match outcome {
        Err(_) => true,
        Ok(c) => c.events.is_empty() && matches!(c.termination, Termination::Disconnected(_)),
    }
}

pub(crate) async fn send_req(ws: &mut WsStream, sub_id: &str, filter: &Filter) -> Result<()> {
    let msg = serde_json::json!(["REQ", sub_id, filter.to_json()]);
    ws.send(Message::Text(msg.to_string())).await?;
    Ok(())
}

/// Best-effort `CLOSE` for a subscription, bounded so teardown never hangs.
pub(crate) async fn close_subscription(ws: &mut WsStream, sub_id: &str) {
    let msg = serde_json::json!(["CLOSE", sub_id]);
    let _ = tokio::time::timeout(CLOSE_GRACE, ws.send(Message::Text(msg.to_string()))).await;
}

/// Subscription id: a stable relay hash prefix plus a random suffix.
pub(crate) fn subscription_id(relay: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(relay.as_bytes());
    let relay_hash = hex::encode(hasher.finalize());
    let suffix: u32 = thread_rng().gen();
    format!("rq-{}-{:08x}", &relay_hash[..8], suffix)
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy. `http(s)`
/// relay URLs are dialed as `ws(s)`; `wss://` relays are wrapped in TLS.
pub(crate) async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<WsStream> {
    let mut url = Url::parse(relay)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return Err(QueryError::InvalidRelayUrl(relay.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| QueryError::InvalidRelayUrl(relay.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| QueryError::InvalidRelayUrl(format!("missing host: {relay}")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| QueryError::InvalidRelayUrl(format!("missing port: {relay}")))?;
    let req = url.as_str().into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
