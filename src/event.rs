//! Nostr event model and result merging.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the following elements hold data, e.g.
/// `["d", "team-slug"]` or `["member", "<pubkey>"]`. Tags are kept verbatim so
/// domain consumers can read custom tags the query layer knows nothing about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name (first element), if any.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First data element following the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Event as delivered by a relay.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "npub...",
///   "kind": 33404,
///   "created_at": 1700000000,
///   "tags": [["d", "team-slug"], ["name", "Morning Runners"]],
///   "content": "",
///   "sig": "deadbeef"
/// }
/// ```
///
/// The signature is passed through untouched; verifying it is up to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `33404`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tags.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Free-form payload.
    #[serde(default)]
    pub content: String,
    /// Schnorr signature over the event hash.
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// Values of every tag named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }
}

/// Running set of event ids used to merge results from several relays or
/// several queries. Insertion order of the merged output is first-seen order.
#[derive(Debug, Default)]
pub struct EventDeduper {
    seen: HashSet<String>,
}

impl EventDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id`, returning `true` the first time it is seen.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string())
    }

    /// Append the events not seen before to `out`; returns how many were new.
    pub fn extend_unique(
        &mut self,
        out: &mut Vec<Event>,
        events: impl IntoIterator<Item = Event>,
    ) -> usize {
        let before = out.len();
        for ev in events {
            if self.insert(&ev.id) {
                out.push(ev);
            }
        }
        out.len() - before
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn sample_event(id: &str, kind: u32, created_at: u64) -> Event {
    Event {
        id: id.into(),
        pubkey: "p".into(),
        kind,
        created_at,
        tags: vec![],
        content: String::new(),
        sig: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_lookup() {
        let mut ev = sample_event("aa11", 33404, 1);
        ev.tags = vec![
            Tag(vec!["d".into(), "slug".into()]),
            Tag(vec!["member".into(), "m1".into()]),
            Tag(vec!["member".into(), "m2".into()]),
            Tag(vec!["bare".into()]),
        ];
        assert_eq!(ev.tag_value("d"), Some("slug"));
        assert_eq!(ev.tag_value("bare"), None);
        assert_eq!(ev.tag_value("missing"), None);
        assert_eq!(ev.tag_values("member").collect::<Vec<_>>(), vec!["m1", "m2"]);
    }

    #[test]
    fn deserializes_without_optional_fields() {
        let ev: Event = serde_json::from_value(serde_json::json!({
            "id": "aa11",
            "pubkey": "p",
            "kind": 1,
            "created_at": 5
        }))
        .unwrap();
        assert!(ev.tags.is_empty());
        assert!(ev.content.is_empty());
    }

    #[test]
    fn deduper_keeps_first_seen_order() {
        let mut dedup = EventDeduper::new();
        let mut out = Vec::new();
        let added = dedup.extend_unique(
            &mut out,
            vec![sample_event("e1", 1, 1), sample_event("e2", 1, 2)],
        );
        assert_eq!(added, 2);
        let added = dedup.extend_unique(
            &mut out,
            vec![
                sample_event("e2", 1, 2),
                sample_event("e3", 1, 3),
                sample_event("e1", 1, 1),
            ],
        );
        assert_eq!(added, 1);
        let ids: Vec<_> = out.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
        assert_eq!(dedup.len(), 3);
    }
}
