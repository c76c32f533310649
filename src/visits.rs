// src/visits.rs
// Visit record store: a bounded, newest-first log of admission verdicts,
// merged in place with client-side reports for the same visit. Also holds
// the independent bounded click log and the aggregate stats snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::NetworkType;
use crate::ipinfo::ReputationRecord;
use crate::kv::KeyValueStore;

const VISITS_KEY: &str = "visits:log";
const CLICKS_KEY: &str = "clicks:log";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitStatus {
    #[serde(rename = "ALLOWED")]
    Allowed,
    #[serde(rename = "BLOCKED")]
    Blocked,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Allowed => "ALLOWED",
            VisitStatus::Blocked => "BLOCKED",
            VisitStatus::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Server,
    Client,
}

/// One visit attempt. Created by the server-side admission check, updated
/// in place when a matching client report arrives; for client reports with
/// no matching server record, created with `source: Client`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VisitRecord {
    pub id: String,
    pub ts: u64,
    pub status: VisitStatus,
    pub reason: String,
    pub source: RecordSource,

    pub ip: String,
    pub country: String,
    pub country_name: String,
    pub city: String,
    pub region: String,
    pub org: String,
    pub isp: String,
    pub asn: Option<String>,
    pub hostname: String,
    pub timezone: String,
    pub network: NetworkType,
    pub is_vpn: bool,
    pub is_data_center: bool,

    pub is_bot: bool,
    pub bot_score: u32,
    #[serde(default)]
    pub bot_reasons: Vec<String>,
    pub user_agent: String,
    pub page_url: String,
    pub referrer: String,

    // Client-reported counterparts, filled by reconciliation. Advisory
    // only: they never override the server verdict above.
    #[serde(default)]
    pub client_status: Option<String>,
    #[serde(default)]
    pub client_reason: Option<String>,
    #[serde(default)]
    pub client_bot: Option<bool>,
    #[serde(default)]
    pub client_bot_reason: Option<String>,
    #[serde(default)]
    pub client_network: Option<String>,
    #[serde(default)]
    pub client_vpn: Option<bool>,
    #[serde(default)]
    pub client_data_center: Option<bool>,
    #[serde(default)]
    pub fingerprint: Option<Value>,
}

impl VisitRecord {
    /// Build a server-origin record from an admission decision.
    pub fn from_admission(
        rep: &ReputationRecord,
        status: VisitStatus,
        reason: &str,
        is_bot: bool,
        bot_score: u32,
        bot_reasons: Vec<String>,
        user_agent: &str,
        page_url: &str,
        referrer: &str,
        now: u64,
    ) -> Self {
        VisitRecord {
            id: new_record_id(),
            ts: now,
            status,
            reason: reason.to_string(),
            source: RecordSource::Server,
            ip: rep.ip.clone(),
            country: rep.country.clone(),
            country_name: rep.country_name.clone(),
            city: rep.city.clone(),
            region: rep.region.clone(),
            org: rep.org.clone(),
            isp: rep.isp.clone(),
            asn: rep.asn.clone(),
            hostname: rep.hostname.clone(),
            timezone: rep.timezone.clone(),
            network: rep.network,
            is_vpn: rep.network.is_vpn(),
            is_data_center: rep.network.is_data_center(),
            is_bot,
            bot_score,
            bot_reasons,
            user_agent: user_agent.to_string(),
            page_url: page_url.to_string(),
            referrer: referrer.to_string(),
            client_status: None,
            client_reason: None,
            client_bot: None,
            client_bot_reason: None,
            client_network: None,
            client_vpn: None,
            client_data_center: None,
            fingerprint: None,
        }
    }
}

/// Client-observed fields carried into a merge (or into a client-origin
/// record when nothing matches).
#[derive(Debug, Clone, Default)]
pub struct ClientFields {
    pub status: Option<String>,
    pub reason: Option<String>,
    pub is_bot: Option<bool>,
    pub bot_reason: Option<String>,
    pub network: Option<String>,
    pub is_vpn: Option<bool>,
    pub is_data_center: Option<bool>,
    pub fingerprint: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Merged,
    Created,
}

/// 8 random bytes as lowercase hex.
pub fn new_record_id() -> String {
    use rand::Rng as _;
    format!("{:016x}", rand::rng().random::<u64>())
}

pub fn load_visits(store: &impl KeyValueStore) -> Vec<VisitRecord> {
    crate::kv::get_json(store, VISITS_KEY).unwrap_or_default()
}

fn save_visits(store: &impl KeyValueStore, visits: &[VisitRecord]) {
    crate::kv::set_json(store, VISITS_KEY, &visits);
}

/// Prepend a record (newest first) and evict beyond the cap.
pub fn push_visit(store: &impl KeyValueStore, record: VisitRecord, cap: usize) {
    let mut visits = load_visits(store);
    visits.insert(0, record);
    visits.truncate(cap);
    save_visits(store, &visits);
}

/// Merge a client report into the server record for the same visit,
/// correlated by IP and time proximity. When no record matches, store the
/// report as a new client-origin record. Correlation by IP alone can
/// mis-merge two rapid visits behind one NAT; accepted limitation.
pub fn reconcile(
    store: &impl KeyValueStore,
    ip: &str,
    fields: ClientFields,
    fallback: VisitRecord,
    window_seconds: u64,
    cap: usize,
    now: u64,
) -> ReconcileOutcome {
    let mut visits = load_visits(store);
    let matched = visits
        .iter_mut()
        .find(|v| v.ip == ip && now.abs_diff(v.ts) <= window_seconds);

    if let Some(record) = matched {
        record.client_status = fields.status;
        record.client_reason = fields.reason;
        record.client_bot = fields.is_bot;
        record.client_bot_reason = fields.bot_reason;
        record.client_network = fields.network;
        record.client_vpn = fields.is_vpn;
        record.client_data_center = fields.is_data_center;
        record.fingerprint = fields.fingerprint;
        save_visits(store, &visits);
        return ReconcileOutcome::Merged;
    }

    drop(visits);
    push_visit(store, fallback, cap);
    ReconcileOutcome::Created
}

/// One tracked click from the instrumentation script.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClickRecord {
    pub id: String,
    pub ts: u64,
    pub ip: String,
    #[serde(default)]
    pub click_count: u64,
    #[serde(default)]
    pub time_since_last_click: u64,
    #[serde(default)]
    pub element: String,
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
    #[serde(default)]
    pub client_timestamp: String,
}

pub fn load_clicks(store: &impl KeyValueStore) -> Vec<ClickRecord> {
    crate::kv::get_json(store, CLICKS_KEY).unwrap_or_default()
}

/// Append a click, evicting the oldest once over the cap.
pub fn push_click(store: &impl KeyValueStore, click: ClickRecord, cap: usize) {
    let mut clicks = load_clicks(store);
    clicks.push(click);
    if clicks.len() > cap {
        let overflow = clicks.len() - cap;
        clicks.drain(..overflow);
    }
    crate::kv::set_json(store, CLICKS_KEY, &clicks);
}

/// Aggregate counters for the reporting snapshot.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub total_visitors: usize,
    pub allowed: usize,
    pub blocked: usize,
    pub bots: usize,
    pub vpn: usize,
    pub data_center: usize,
    pub total_clicks: usize,
}

pub fn stats(visits: &[VisitRecord], clicks: &[ClickRecord]) -> Stats {
    Stats {
        total_visitors: visits.len(),
        allowed: visits
            .iter()
            .filter(|v| v.status == VisitStatus::Allowed)
            .count(),
        blocked: visits
            .iter()
            .filter(|v| v.status == VisitStatus::Blocked)
            .count(),
        bots: visits.iter().filter(|v| v.is_bot).count(),
        vpn: visits.iter().filter(|v| v.is_vpn).count(),
        data_center: visits.iter().filter(|v| v.is_data_center).count(),
        total_clicks: clicks.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipinfo::ReputationRecord;
    use crate::test_support::InMemoryStore;

    const CAP: usize = 5;
    const WINDOW: u64 = 60;
    const NOW: u64 = 1_700_000_000;

    fn server_record(ip: &str, ts: u64) -> VisitRecord {
        let rep = ReputationRecord::unknown(ip, ts);
        VisitRecord::from_admission(
            &rep,
            VisitStatus::Allowed,
            "Legitimate visitor",
            false,
            0,
            vec![],
            "TestUA",
            "http://gate.test/abc",
            "Direct",
            ts,
        )
    }

    fn client_record(ip: &str, ts: u64) -> VisitRecord {
        let mut rec = server_record(ip, ts);
        rec.source = RecordSource::Client;
        rec
    }

    #[test]
    fn push_is_newest_first_and_capped() {
        let store = InMemoryStore::default();
        for i in 0..(CAP as u64 + 3) {
            push_visit(&store, server_record("203.0.113.9", NOW + i), CAP);
        }
        let visits = load_visits(&store);
        assert_eq!(visits.len(), CAP);
        // Newest first, oldest evicted.
        assert_eq!(visits[0].ts, NOW + CAP as u64 + 2);
        assert_eq!(visits[CAP - 1].ts, NOW + 3);
    }

    #[test]
    fn client_report_within_window_merges_in_place() {
        let store = InMemoryStore::default();
        push_visit(&store, server_record("1.2.3.4", NOW), CAP);

        let fields = ClientFields {
            status: Some("ALLOWED".to_string()),
            reason: Some("Legitimate visitor".to_string()),
            is_bot: Some(false),
            network: Some("Residential/ISP".to_string()),
            fingerprint: Some(serde_json::json!({"screen": "1920x1080x24"})),
            ..Default::default()
        };
        let outcome = reconcile(
            &store,
            "1.2.3.4",
            fields,
            client_record("1.2.3.4", NOW + 30),
            WINDOW,
            CAP,
            NOW + 30,
        );
        assert_eq!(outcome, ReconcileOutcome::Merged);

        let visits = load_visits(&store);
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].source, RecordSource::Server);
        assert_eq!(visits[0].client_status.as_deref(), Some("ALLOWED"));
        assert!(visits[0].fingerprint.is_some());
    }

    #[test]
    fn unmatched_client_report_creates_client_origin_record() {
        let store = InMemoryStore::default();
        push_visit(&store, server_record("1.2.3.4", NOW), CAP);

        let outcome = reconcile(
            &store,
            "5.6.7.8",
            ClientFields::default(),
            client_record("5.6.7.8", NOW + 10),
            WINDOW,
            CAP,
            NOW + 10,
        );
        assert_eq!(outcome, ReconcileOutcome::Created);

        let visits = load_visits(&store);
        assert_eq!(visits.len(), 2);
        assert_eq!(visits[0].source, RecordSource::Client);
        assert_eq!(visits[0].ip, "5.6.7.8");
    }

    #[test]
    fn stale_server_record_outside_window_is_not_merged() {
        let store = InMemoryStore::default();
        push_visit(&store, server_record("1.2.3.4", NOW), CAP);

        let outcome = reconcile(
            &store,
            "1.2.3.4",
            ClientFields::default(),
            client_record("1.2.3.4", NOW + WINDOW + 1),
            WINDOW,
            CAP,
            NOW + WINDOW + 1,
        );
        assert_eq!(outcome, ReconcileOutcome::Created);
        assert_eq!(load_visits(&store).len(), 2);
    }

    #[test]
    fn click_log_is_capped_keeping_newest() {
        let store = InMemoryStore::default();
        for i in 0..8u64 {
            let click = ClickRecord {
                id: new_record_id(),
                ts: NOW + i,
                ip: "1.2.3.4".to_string(),
                click_count: i,
                time_since_last_click: 100,
                element: "A".to_string(),
                x: 10,
                y: 20,
                client_timestamp: String::new(),
            };
            push_click(&store, click, 5);
        }
        let clicks = load_clicks(&store);
        assert_eq!(clicks.len(), 5);
        assert_eq!(clicks[0].ts, NOW + 3);
        assert_eq!(clicks[4].ts, NOW + 7);
    }

    #[test]
    fn stats_count_by_verdict_and_flags() {
        let store = InMemoryStore::default();
        let mut blocked = server_record("9.9.9.9", NOW);
        blocked.status = VisitStatus::Blocked;
        blocked.is_bot = true;
        blocked.is_vpn = true;
        push_visit(&store, blocked, CAP);
        push_visit(&store, server_record("1.2.3.4", NOW + 1), CAP);

        let s = stats(&load_visits(&store), &load_clicks(&store));
        assert_eq!(s.total_visitors, 2);
        assert_eq!(s.allowed, 1);
        assert_eq!(s.blocked, 1);
        assert_eq!(s.bots, 1);
        assert_eq!(s.vpn, 1);
        assert_eq!(s.data_center, 0);
        assert_eq!(s.total_clicks, 0);
    }
}
