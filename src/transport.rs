//! Transport seam between the coordinator and the network strategies.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    direct::DirectQuery,
    error::Result,
    event::Event,
    filter::Filter,
    http::HttpStrategy,
    pool::{ConnectionPool, PoolConfig},
    ws::WebSocketStrategy,
};

/// Executes single strategy attempts against one relay.
///
/// Implementations bound each call by `timeout` and clean up their own
/// connections; the coordinator decides ordering, fallbacks and bookkeeping.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn http_query(&self, relay: &str, filter: &Filter, timeout: Duration) -> Result<Vec<Event>>;

    async fn ws_query(&self, relay: &str, filter: &Filter, timeout: Duration) -> Result<Vec<Event>>;

    /// Fresh, unpooled connection with a simplified filter.
    async fn direct_query(&self, relay: &str, filter: &Filter, timeout: Duration) -> Result<Vec<Event>>;

    /// Release pooled resources.
    async fn shutdown(&self) {}
}

/// Real network transport composed of the HTTP, WebSocket and direct strategies.
pub struct NetworkTransport {
    http: HttpStrategy,
    ws: WebSocketStrategy,
    direct: DirectQuery,
}

impl NetworkTransport {
    pub fn new(http_query_path: &str, pool: PoolConfig, tor_socks: Option<String>) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::new(pool, tor_socks.clone()));
        Ok(Self {
            http: HttpStrategy::new(http_query_path)?,
            ws: WebSocketStrategy::new(pool),
            direct: DirectQuery::new(tor_socks),
        })
    }
}

#[async_trait]
impl RelayTransport for NetworkTransport {
    async fn http_query(&self, relay: &str, filter: &Filter, timeout: Duration) -> Result<Vec<Event>> {
        self.http.query(relay, filter, timeout).await
    }

    async fn ws_query(&self, relay: &str, filter: &Filter, timeout: Duration) -> Result<Vec<Event>> {
        self.ws.query(relay, filter, timeout).await
    }

    async fn direct_query(&self, relay: &str, filter: &Filter, timeout: Duration) -> Result<Vec<Event>> {
        self.direct.query(relay, filter, timeout).await
    }

    async fn shutdown(&self) {
        self.ws.pool().close_all().await;
    }
}
