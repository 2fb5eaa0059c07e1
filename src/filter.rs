//! Nostr subscription filters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueryError, Result};

/// Query descriptor sent to a relay, serialized as a NIP-01 filter object.
///
/// ```json
/// {"kinds": [1301], "authors": ["abc"], "#t": ["running"], "since": 1700000000, "limit": 10}
/// ```
///
/// Tag constraints are keyed by their `#` prefix. A filter has no identity of
/// its own; [`Filter::cache_key`] gives equivalent filters the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Restrict to event kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    /// Restrict to author public keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    /// Tag filters such as `#d` or `#t`.
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
    /// Lower bound for `created_at` (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    /// Upper bound for `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    /// Maximum number of events requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors<S: Into<String>>(mut self, authors: impl IntoIterator<Item = S>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Add a single-letter tag constraint, e.g. `tag('t', ["running"])`.
    pub fn tag<S: Into<String>>(mut self, letter: char, values: impl IntoIterator<Item = S>) -> Self {
        self.tags.insert(
            format!("#{letter}"),
            values.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Build a filter from an arbitrary JSON object, skipping entries that do
    /// not fit the filter shape instead of rejecting the whole object.
    pub fn from_value(val: &Value) -> Self {
        let strings = |v: &Value| -> Option<Vec<String>> {
            v.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
        };
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().and_then(|u| u32::try_from(u).ok()))
                .collect()
        });
        let authors = val.get("authors").and_then(strings);
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                if is_tag_key(key) {
                    if let Some(values) = strings(v) {
                        tags.insert(key.clone(), values);
                    }
                }
            }
        }
        Filter {
            kinds,
            authors,
            tags,
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val
                .get("limit")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok()),
        }
    }

    /// JSON object used in `REQ` messages and HTTP request bodies.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    /// Deterministic serialization used as the cache key component.
    ///
    /// List fields are sorted and deduplicated, so filters that select the
    /// same events regardless of list order share a key.
    pub fn cache_key(&self) -> String {
        let mut canonical = self.clone();
        if let Some(kinds) = canonical.kinds.as_mut() {
            kinds.sort_unstable();
            kinds.dedup();
        }
        if let Some(authors) = canonical.authors.as_mut() {
            authors.sort();
            authors.dedup();
        }
        for values in canonical.tags.values_mut() {
            values.sort();
            values.dedup();
        }
        canonical.to_json().to_string()
    }

    /// Reject filters that no relay should be asked to run.
    pub fn validate(&self) -> Result<()> {
        if let Some(authors) = &self.authors {
            if authors.iter().any(|a| a.trim().is_empty()) {
                return Err(QueryError::InvalidFilter("empty author".into()));
            }
        }
        for key in self.tags.keys() {
            if !is_tag_key(key) {
                return Err(QueryError::InvalidFilter(format!("bad tag key {key:?}")));
            }
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since >= until {
                return Err(QueryError::InvalidFilter(format!(
                    "empty time range since={since} until={until}"
                )));
            }
        }
        if self.limit == Some(0) {
            return Err(QueryError::InvalidFilter("limit must be positive".into()));
        }
        Ok(())
    }

    /// Degraded form used by the direct emergency path: tag constraints are
    /// dropped and the limit is capped at `max_limit`.
    pub fn simplified(&self, max_limit: u32) -> Filter {
        Filter {
            kinds: self.kinds.clone(),
            authors: self.authors.clone(),
            tags: BTreeMap::new(),
            since: self.since,
            until: self.until,
            limit: Some(self.limit.map_or(max_limit, |l| l.min(max_limit))),
        }
    }
}

/// Tag keys are `#` followed by a single ASCII letter.
fn is_tag_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars.next() == Some('#')
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.next().is_none()
}
