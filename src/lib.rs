//! Multi-strategy Nostr relay querying.
//!
//! [`coordinator::HybridQueryCoordinator`] is the entry point: it queries
//! relays over HTTP or WebSocket depending on observed performance, falls back
//! to a direct emergency query, caches results and fans out over many relays.
//! [`team::TeamDiscovery`] builds layered discovery on top of it and
//! [`server`] exposes it as an HTTP gateway.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod direct;
pub mod error;
pub mod event;
pub mod filter;
pub mod http;
pub mod metrics;
pub mod pool;
pub mod query;
pub mod server;
pub mod strategy;
pub mod team;
pub mod transport;
pub mod ws;

#[cfg(test)]
mod testing;

pub use coordinator::{CoordinatorConfig, HybridQueryCoordinator};
pub use error::{QueryError, Result};
pub use event::Event;
pub use filter::Filter;
pub use query::{MultiRelayResult, QueryMethod, QueryOptions, QueryResult};
pub use strategy::Strategy;
