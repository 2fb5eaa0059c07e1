//! Scripted in-memory transport for coordinator and discovery tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::{QueryError, Result},
    event::Event,
    filter::Filter,
    pool::lock,
    strategy::Strategy,
    transport::RelayTransport,
};

/// How one strategy answers for a relay.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Events(Vec<Event>),
    /// Events only when the filter limit is at most the given value.
    UpToLimit(u32, Vec<Event>),
    /// Stored events that match the filter's kinds and time window, newest
    /// first, capped at the filter limit.
    Store(Vec<Event>),
    Fail,
    Hang,
}

impl Reply {
    async fn answer(&self, filter: &Filter) -> Result<Vec<Event>> {
        match self {
            Reply::Events(events) => Ok(events.clone()),
            Reply::UpToLimit(max, events) => match filter.limit {
                Some(limit) if limit <= *max => Ok(events.clone()),
                _ => Err(QueryError::Connection("limit too large".into())),
            },
            Reply::Store(events) => Ok(matching(events, filter)),
            Reply::Fail => Err(QueryError::Connection("scripted failure".into())),
            Reply::Hang => {
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
        }
    }
}

fn matching(events: &[Event], filter: &Filter) -> Vec<Event> {
    let mut out: Vec<Event> = events
        .iter()
        .filter(|e| filter.kinds.as_ref().map_or(true, |k| k.contains(&e.kind)))
        .filter(|e| filter.since.map_or(true, |s| e.created_at >= s))
        .filter(|e| filter.until.map_or(true, |u| e.created_at <= u))
        .cloned()
        .collect();
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = filter.limit {
        out.truncate(limit as usize);
    }
    out
}

#[derive(Debug, Clone)]
struct Script {
    http: Reply,
    ws: Reply,
    direct: Reply,
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub relay: String,
    pub strategy: Strategy,
    pub filter: Filter,
}

/// Transport whose answers are scripted per relay. Unscripted relays fail.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<Call>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    shut_down: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes at least `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn script(&self, relay: &str, http: Reply, ws: Reply, direct: Reply) {
        lock(&self.scripts).insert(relay.to_string(), Script { http, ws, direct });
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn strategies(&self) -> Vec<Strategy> {
        lock(&self.calls).iter().map(|c| c.strategy).collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    async fn call(&self, relay: &str, strategy: Strategy, filter: &Filter) -> Result<Vec<Event>> {
        lock(&self.calls).push(Call {
            relay: relay.to_string(),
            strategy,
            filter: filter.clone(),
        });
        let reply = lock(&self.scripts).get(relay).map(|s| match strategy {
            Strategy::Http => s.http.clone(),
            Strategy::WebSocket => s.ws.clone(),
            Strategy::Emergency => s.direct.clone(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = match reply {
            Some(reply) => reply.answer(filter).await,
            None => Err(QueryError::Connection("unscripted relay".into())),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl RelayTransport for ScriptedTransport {
    async fn http_query(&self, relay: &str, filter: &Filter, _timeout: Duration) -> Result<Vec<Event>> {
        self.call(relay, Strategy::Http, filter).await
    }

    async fn ws_query(&self, relay: &str, filter: &Filter, _timeout: Duration) -> Result<Vec<Event>> {
        self.call(relay, Strategy::WebSocket, filter).await
    }

    async fn direct_query(&self, relay: &str, filter: &Filter, _timeout: Duration) -> Result<Vec<Event>> {
        self.call(relay, Strategy::Emergency, filter).await
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
