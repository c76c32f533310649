// src/events.rs
// Capped operational event log, mirrored to stdout.

use serde::{Deserialize, Serialize};

use crate::kv::KeyValueStore;

const EVENTS_KEY: &str = "events:log";
const EVENTS_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    VisitAllowed,
    VisitBlocked,
    TokenIssued,
    TokenRotated,
    RateLimited,
    ClientReport,
    LinkCreated,
    AdminLogin,
    LookupDegraded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::VisitAllowed => "visit_allowed",
            EventKind::VisitBlocked => "visit_blocked",
            EventKind::TokenIssued => "token_issued",
            EventKind::TokenRotated => "token_rotated",
            EventKind::RateLimited => "rate_limited",
            EventKind::ClientReport => "client_report",
            EventKind::LinkCreated => "link_created",
            EventKind::AdminLogin => "admin_login",
            EventKind::LookupDegraded => "lookup_degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub ts: u64,
    pub kind: EventKind,
    pub ip: String,
    pub detail: String,
}

pub fn load_events(store: &impl KeyValueStore) -> Vec<EventLogEntry> {
    crate::kv::get_json(store, EVENTS_KEY).unwrap_or_default()
}

/// Prepend an entry, newest first, and echo it to the component log.
pub fn log_event(store: &impl KeyValueStore, kind: EventKind, ip: &str, detail: &str) {
    println!("[event] {} ip={} {}", kind.as_str(), ip, detail);
    let entry = EventLogEntry {
        ts: crate::now_ts(),
        kind,
        ip: ip.to_string(),
        detail: detail.to_string(),
    };
    let mut events = load_events(store);
    events.insert(0, entry);
    if events.len() > EVENTS_CAP {
        events.truncate(EVENTS_CAP);
    }
    crate::kv::set_json(store, EVENTS_KEY, &events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryStore;

    #[test]
    fn events_are_newest_first() {
        let store = InMemoryStore::default();
        log_event(&store, EventKind::TokenIssued, "1.2.3.4", "first");
        log_event(&store, EventKind::VisitBlocked, "5.6.7.8", "second");
        let events = load_events(&store);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].detail, "second");
        assert_eq!(events[0].kind, EventKind::VisitBlocked);
        assert_eq!(events[1].detail, "first");
    }

    #[test]
    fn event_log_is_capped() {
        let store = InMemoryStore::default();
        let mut events: Vec<EventLogEntry> = (0..EVENTS_CAP)
            .map(|i| EventLogEntry {
                ts: i as u64,
                kind: EventKind::VisitAllowed,
                ip: "1.1.1.1".to_string(),
                detail: format!("e{}", i),
            })
            .collect();
        events.reverse();
        crate::kv::set_json(&store, EVENTS_KEY, &events);

        log_event(&store, EventKind::RateLimited, "2.2.2.2", "overflow");
        let events = load_events(&store);
        assert_eq!(events.len(), EVENTS_CAP);
        assert_eq!(events[0].detail, "overflow");
    }
}
