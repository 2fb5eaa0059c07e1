//! Per-relay pool of idle WebSocket connections.
//!
//! A connection is owned either by the pool (idle) or by exactly one
//! in-flight query. Idle connections expire after `idle_timeout` and are
//! closed on the next checkout for that relay or on [`ConnectionPool::close_all`].

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    error::Result,
    ws::{connect_ws, WsStream},
};

/// Upper bound for closing handshakes so teardown never hangs.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per relay; extra ones are closed on checkin.
    pub max_idle_per_relay: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_relay: 2,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// A WebSocket connection checked out of the pool.
pub struct PooledConnection {
    relay: String,
    ws: WsStream,
    reused: bool,
}

impl PooledConnection {
    pub(crate) fn stream(&mut self) -> &mut WsStream {
        &mut self.ws
    }

    /// Whether this connection sat idle in the pool before this checkout.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Close the socket with a bounded closing handshake.
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(CLOSE_GRACE, self.ws.close(None)).await;
    }
}

struct IdleConnection {
    ws: WsStream,
    returned_at: Instant,
}

/// Reuses live connections across queries to the same relay.
pub struct ConnectionPool {
    config: PoolConfig,
    tor_socks: Option<String>,
    idle: Mutex<HashMap<String, Vec<IdleConnection>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, tor_socks: Option<String>) -> Self {
        Self {
            config,
            tor_socks,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Take an idle connection for `relay` or dial a new one.
    pub async fn checkout(&self, relay: &str) -> Result<PooledConnection> {
        let (reusable, expired) = self.take_idle(relay);
        for mut stale in expired {
            debug!(relay, "closing expired pooled connection");
            let _ = tokio::time::timeout(CLOSE_GRACE, stale.ws.close(None)).await;
        }
        if let Some(ws) = reusable {
            debug!(relay, "reusing pooled connection");
            return Ok(PooledConnection {
                relay: relay.to_string(),
                ws,
                reused: true,
            });
        }
        self.connect_fresh(relay).await
    }

    /// Dial a new connection without consulting the idle list.
    pub async fn connect_fresh(&self, relay: &str) -> Result<PooledConnection> {
        let ws = connect_ws(relay, self.tor_socks.as_deref()).await?;
        debug!(relay, "opened websocket connection");
        Ok(PooledConnection {
            relay: relay.to_string(),
            ws,
            reused: false,
        })
    }

    /// Return a healthy connection. Connections beyond the per-relay idle cap
    /// are closed instead.
    pub async fn checkin(&self, conn: PooledConnection) {
        let overflow = {
            let mut idle = lock(&self.idle);
            let list = idle.entry(conn.relay.clone()).or_default();
            if list.len() < self.config.max_idle_per_relay {
                list.push(IdleConnection {
                    ws: conn.ws,
                    returned_at: Instant::now(),
                });
                None
            } else {
                Some(conn)
            }
        };
        if let Some(conn) = overflow {
            conn.close().await;
        }
    }

    /// Close every idle connection.
    pub async fn close_all(&self) {
        let drained: Vec<IdleConnection> = {
            let mut idle = lock(&self.idle);
            idle.drain().flat_map(|(_, list)| list).collect()
        };
        for mut conn in drained {
            let _ = tokio::time::timeout(CLOSE_GRACE, conn.ws.close(None)).await;
        }
    }

    /// Number of idle connections held for `relay`.
    pub fn idle_count(&self, relay: &str) -> usize {
        lock(&self.idle).get(relay).map_or(0, Vec::len)
    }

    /// Pop the most recently returned live connection and remove expired ones.
    fn take_idle(&self, relay: &str) -> (Option<WsStream>, Vec<IdleConnection>) {
        let mut idle = lock(&self.idle);
        let Some(list) = idle.get_mut(relay) else {
            return (None, Vec::new());
        };
        let timeout = self.config.idle_timeout;
        let (live, expired): (Vec<_>, Vec<_>) = list
            .drain(..)
            .partition(|c| c.returned_at.elapsed() < timeout);
        *list = live;
        (list.pop().map(|c| c.ws), expired)
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
