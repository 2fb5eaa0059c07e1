//! Team discovery over several relays.
//!
//! A single broad query against a constrained WebSocket stack loses most of
//! the events it should return, so discovery runs in layers: a broad query
//! everywhere, time-partitioned queries against the best relay, the same
//! partitions against the other relays, and finally no-time queries with
//! growing limits when the result is still sparse. One deduper spans all
//! layers.

use std::{collections::HashMap, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    coordinator::HybridQueryCoordinator,
    event::{Event, EventDeduper},
    filter::Filter,
    metrics::unix_now,
    query::QueryOptions,
};

/// Replaceable event kind carrying team definitions.
pub const TEAM_KIND: u32 = 33404;

const DAY: u64 = 24 * 60 * 60;

/// Names that mark throwaway or placeholder teams.
const PLACEHOLDER_NAMES: &[&str] = &["test", "test team", "placeholder", "untitled", "deleted", "asdf", "team"];

/// Age window in days, `from` inclusive; `to = None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from_days: u64,
    pub to_days: Option<u64>,
}

impl TimeRange {
    pub const fn days(from_days: u64, to_days: u64) -> Self {
        Self {
            from_days,
            to_days: Some(to_days),
        }
    }

    pub const fn older_than(from_days: u64) -> Self {
        Self {
            from_days,
            to_days: None,
        }
    }

    /// `(since, until)` relative to `now`. Adjacent ranges share no second.
    pub fn window(&self, now: u64) -> (Option<u64>, u64) {
        let until = now.saturating_sub(self.from_days * DAY);
        let since = self
            .to_days
            .map(|to| now.saturating_sub(to * DAY).saturating_add(1));
        (since, until)
    }

    fn filter(&self, base: &Filter, now: u64) -> Filter {
        let (since, until) = self.window(now);
        let mut f = base.clone().until(until);
        f.since = since;
        f
    }
}

#[derive(Debug, Clone)]
pub struct TeamDiscoveryConfig {
    pub kind: u32,
    pub relays: Vec<String>,
    /// Limit of the broad first-layer query.
    pub broad_limit: u32,
    /// Recent first, non-overlapping.
    pub ranges: Vec<TimeRange>,
    pub range_limit: u32,
    /// Below this many unique events the escalating pass runs.
    pub sparse_threshold: usize,
    pub escalating_limits: Vec<u32>,
    /// Budget for each relay within a discovery query.
    pub layer_timeout: Duration,
    /// Pause between consecutive discovery queries.
    pub query_delay: Duration,
}

impl Default for TeamDiscoveryConfig {
    fn default() -> Self {
        Self {
            kind: TEAM_KIND,
            relays: [
                "wss://relay.damus.io",
                "wss://nos.lol",
                "wss://relay.primal.net",
                "wss://nostr.wine",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            broad_limit: 100,
            ranges: vec![
                TimeRange::days(0, 7),
                TimeRange::days(7, 30),
                TimeRange::days(30, 90),
                TimeRange::days(90, 365),
                TimeRange::older_than(365),
            ],
            range_limit: 50,
            sparse_threshold: 10,
            escalating_limits: vec![50, 100, 200],
            layer_timeout: Duration::from_secs(10),
            query_delay: Duration::from_millis(100),
        }
    }
}

/// Team definition parsed from a team event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Team {
    pub event_id: String,
    /// Value of the `d` tag; unique per captain.
    pub identifier: String,
    pub name: String,
    pub description: String,
    pub captain: String,
    pub members: Vec<String>,
    pub activity_type: Option<String>,
    pub location: Option<String>,
    pub is_public: bool,
    pub created_at: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TeamRejection {
    #[error("team has no name")]
    EmptyName,
    #[error("placeholder team name: {0}")]
    Placeholder(String),
    #[error("team has no d tag")]
    MissingIdentifier,
    #[error("team is private")]
    Private,
}

impl Team {
    pub fn from_event(ev: &Event) -> Result<Team, TeamRejection> {
        let name = ev.tag_value("name").unwrap_or_default().trim().to_string();
        if name.is_empty() {
            return Err(TeamRejection::EmptyName);
        }
        if PLACEHOLDER_NAMES.contains(&name.to_lowercase().as_str()) {
            return Err(TeamRejection::Placeholder(name));
        }
        let identifier = match ev.tag_value("d") {
            Some(d) if !d.trim().is_empty() => d.trim().to_string(),
            _ => return Err(TeamRejection::MissingIdentifier),
        };
        let is_public = ev
            .tag_value("public")
            .map_or(true, |v| !v.eq_ignore_ascii_case("false"));
        if !is_public {
            return Err(TeamRejection::Private);
        }

        let description = ev
            .tag_value("about")
            .or_else(|| ev.tag_value("description"))
            .unwrap_or(&ev.content)
            .to_string();
        let captain = ev.tag_value("captain").unwrap_or(&ev.pubkey).to_string();
        let mut members: Vec<String> = Vec::new();
        for m in ev.tag_values("member") {
            if !members.iter().any(|x| x == m) {
                members.push(m.to_string());
            }
        }
        Ok(Team {
            event_id: ev.id.clone(),
            identifier,
            name,
            description,
            captain,
            members,
            activity_type: ev.tag_value("type").map(String::from),
            location: ev.tag_value("location").map(String::from),
            is_public,
            created_at: ev.created_at,
        })
    }
}

/// Outcome of one discovery run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeamDiscoveryReport {
    /// Newest version of each team, newest first.
    pub teams: Vec<Team>,
    /// Unique events seen across all layers.
    pub events_seen: usize,
    pub rejected: usize,
}

pub struct TeamDiscovery {
    coordinator: HybridQueryCoordinator,
    config: TeamDiscoveryConfig,
}

impl TeamDiscovery {
    pub fn new(coordinator: HybridQueryCoordinator, config: TeamDiscoveryConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    pub async fn discover_teams(&self) -> TeamDiscoveryReport {
        let cfg = &self.config;
        let now = unix_now();
        let base = Filter::new().kinds([cfg.kind]);
        let mut seen = EventDeduper::new();
        let mut events = Vec::new();

        // Layer 1: broad query everywhere.
        let broad = base.clone().limit(cfg.broad_limit);
        let result = self
            .coordinator
            .query_multiple_relays(&cfg.relays, &broad, &self.options(false))
            .await;
        let added = seen.extend_unique(&mut events, result.events);
        debug!(added, successful = result.successful_relays, "broad layer finished");

        // Layers 2 and 3: time ranges, best relay first.
        let (best, secondary) = self.split_relays();
        if let Some(best) = best {
            let added = self.range_pass(&best, &base, now, &mut seen, &mut events).await;
            debug!(relay = %best, added, "primary range layer finished");
        }
        for relay in &secondary {
            let added = self.range_pass(relay, &base, now, &mut seen, &mut events).await;
            debug!(%relay, added, "secondary range layer finished");
        }

        // Layer 4: still sparse, retry without time bounds.
        if seen.len() < cfg.sparse_threshold {
            for &limit in &cfg.escalating_limits {
                tokio::time::sleep(cfg.query_delay).await;
                let result = self
                    .coordinator
                    .query_multiple_relays(&cfg.relays, &base.clone().limit(limit), &self.options(true))
                    .await;
                let added = seen.extend_unique(&mut events, result.events);
                debug!(limit, added, successful = result.successful_relays, "escalating layer step finished");
            }
        }

        let report = collect_teams(&events, cfg.kind);
        info!(
            teams = report.teams.len(),
            events = seen.len(),
            rejected = report.rejected,
            "team discovery finished"
        );
        report
    }

    /// Each relay gets `layer_timeout`; a slow relay never discards the
    /// answers of the others.
    fn options(&self, skip_cache: bool) -> QueryOptions {
        QueryOptions {
            skip_cache,
            budget: Some(self.config.layer_timeout),
            ..Default::default()
        }
    }

    /// Best-ranked configured relay and the rest, in configured order.
    fn split_relays(&self) -> (Option<String>, Vec<String>) {
        let relays = &self.config.relays;
        let best = self
            .coordinator
            .best_performing_relays(usize::MAX)
            .into_iter()
            .find(|r| relays.contains(r))
            .or_else(|| relays.first().cloned());
        let secondary = relays
            .iter()
            .filter(|r| Some(*r) != best.as_ref())
            .cloned()
            .collect();
        (best, secondary)
    }

    async fn range_pass(
        &self,
        relay: &str,
        base: &Filter,
        now: u64,
        seen: &mut EventDeduper,
        events: &mut Vec<Event>,
    ) -> usize {
        let mut added = 0;
        for range in &self.config.ranges {
            tokio::time::sleep(self.config.query_delay).await;
            let filter = range.filter(base, now).limit(self.config.range_limit);
            let result = self
                .coordinator
                .query_relay(relay, &filter, &self.options(false))
                .await;
            if !result.success {
                warn!(relay, ?range, error = ?result.error, "team range query failed");
            }
            added += seen.extend_unique(events, result.events);
        }
        added
    }
}

/// Parse, validate and collapse team events to the newest version per
/// `(captain, d)`.
pub fn collect_teams(events: &[Event], kind: u32) -> TeamDiscoveryReport {
    let mut latest: HashMap<(String, String), Team> = HashMap::new();
    let mut rejected = 0;
    for ev in events.iter().filter(|e| e.kind == kind) {
        match Team::from_event(ev) {
            Ok(team) => {
                let key = (team.captain.clone(), team.identifier.clone());
                match latest.get(&key) {
                    Some(existing) if existing.created_at >= team.created_at => {}
                    _ => {
                        latest.insert(key, team);
                    }
                }
            }
            Err(reason) => {
                debug!(id = %ev.id, %reason, "team rejected");
                rejected += 1;
            }
        }
    }
    let mut teams: Vec<Team> = latest.into_values().collect();
    teams.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.name.cmp(&b.name))
    });
    TeamDiscoveryReport {
        teams,
        events_seen: events.len(),
        rejected,
    }
}
