//! Short-lived cache of successful relay query results.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{event::Event, filter::Filter};

/// Default lifetime of a cached result.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    events: Vec<Event>,
    stored_at: Instant,
}

/// Results keyed by relay URL and the filter's canonical serialization.
/// Expired entries are dropped lazily when read.
pub struct QueryCache {
    ttl: Duration,
    entries: HashMap<(String, String), CacheEntry>,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Live events for `(relay, filter)`, evicting the entry if it expired.
    pub fn get(&mut self, relay: &str, filter: &Filter) -> Option<Vec<Event>> {
        let key = cache_key(relay, filter);
        let expired = match self.entries.get(&key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                return Some(entry.events.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(&key);
        }
        None
    }

    /// Store a result. Empty results are never cached.
    pub fn put(&mut self, relay: &str, filter: &Filter, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        self.entries.insert(
            cache_key(relay, filter),
            CacheEntry {
                events: events.to_vec(),
                stored_at: Instant::now(),
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

fn cache_key(relay: &str, filter: &Filter) -> (String, String) {
    (relay.to_string(), filter.cache_key())
}
