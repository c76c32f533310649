// src/report.rs
// Client instrumentation endpoints: the advisory verdict report, the click
// tracker, and the read-only data snapshot for reporting.

use serde_json::{json, Value};
use spin_sdk::http::{Method, Request, Response};

use crate::classify;
use crate::config::Config;
use crate::events::{self, EventKind};
use crate::input_validation::{parse_json_body, MAX_CLICK_BYTES, MAX_REPORT_BYTES};
use crate::ipinfo::ReputationRecord;
use crate::kv::KeyValueStore;
use crate::visits::{
    self, ClickRecord, ClientFields, RecordSource, VisitRecord, VisitStatus,
};

fn json_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn json_bool(value: &Value, key: &str) -> Option<bool> {
    value.get(key).and_then(|v| v.as_bool())
}

fn parse_status(raw: Option<&str>) -> VisitStatus {
    match raw {
        Some("ALLOWED") => VisitStatus::Allowed,
        Some("BLOCKED") => VisitStatus::Blocked,
        _ => VisitStatus::Unknown,
    }
}

/// POST /__antibot-report. Merges the client's advisory verdict into the
/// server record for the same visit, or stores it as a client-origin
/// record when nothing correlates. The reported IP field is ignored; the
/// connection's own IP is authoritative.
pub fn handle_report(req: &Request, store: &impl KeyValueStore, cfg: &Config) -> Response {
    handle_report_at(req, store, cfg, crate::now_ts())
}

pub fn handle_report_at(
    req: &Request,
    store: &impl KeyValueStore,
    cfg: &Config,
    now: u64,
) -> Response {
    if req.method() != &Method::Post {
        return Response::new(405, "Method Not Allowed");
    }
    let payload = match parse_json_body(req.body(), MAX_REPORT_BYTES) {
        Ok(v) => v,
        Err(msg) => return Response::new(400, msg),
    };

    let ip = crate::ip::normalize_ip(&crate::extract_client_ip(req));
    let fields = ClientFields {
        status: json_str(&payload, "status"),
        reason: json_str(&payload, "reason"),
        is_bot: json_bool(&payload, "isBot"),
        bot_reason: json_str(&payload, "botReason"),
        network: json_str(&payload, "ipType"),
        is_vpn: json_bool(&payload, "isVPN"),
        is_data_center: json_bool(&payload, "isDataCenter"),
        fingerprint: payload.get("fingerprint").cloned(),
    };

    let fallback = client_origin_record(store, cfg, &ip, &payload, &fields, now);
    let outcome = visits::reconcile(
        store,
        &ip,
        fields,
        fallback,
        cfg.correlation_window_seconds,
        cfg.visitor_cap,
        now,
    );
    events::log_event(
        store,
        EventKind::ClientReport,
        &ip,
        &format!("{:?}", outcome).to_lowercase(),
    );

    json_ok()
}

/// Build the record stored when no server-side visit correlates with a
/// report. Reputation comes from the cache when present; the reported
/// user agent is re-scored server-side instead of trusting the client.
fn client_origin_record(
    store: &impl KeyValueStore,
    cfg: &Config,
    ip: &str,
    payload: &Value,
    fields: &ClientFields,
    now: u64,
) -> VisitRecord {
    let rep = crate::ipinfo::cached_record(store, ip)
        .unwrap_or_else(|| ReputationRecord::unknown(ip, now));
    let user_agent = json_str(payload, "userAgent").unwrap_or_default();
    let page_url = json_str(payload, "pageUrl").unwrap_or_default();
    let referrer = json_str(payload, "referrer").unwrap_or_else(|| "Direct".to_string());

    let (bot_score, bot_reasons) = classify::score_user_agent(&user_agent);
    let is_bot = bot_score >= cfg.bot_score_threshold;
    let status = parse_status(fields.status.as_deref());

    let mut record = VisitRecord::from_admission(
        &rep,
        status,
        "Client-reported visit",
        is_bot,
        bot_score,
        bot_reasons,
        &user_agent,
        &page_url,
        &referrer,
        now,
    );
    record.source = RecordSource::Client;
    record
}

/// POST /__track-click. Appends to the independent bounded click log.
pub fn handle_track_click(req: &Request, store: &impl KeyValueStore, cfg: &Config) -> Response {
    handle_track_click_at(req, store, cfg, crate::now_ts())
}

pub fn handle_track_click_at(
    req: &Request,
    store: &impl KeyValueStore,
    cfg: &Config,
    now: u64,
) -> Response {
    if req.method() != &Method::Post {
        return Response::new(405, "Method Not Allowed");
    }
    let payload = match parse_json_body(req.body(), MAX_CLICK_BYTES) {
        Ok(v) => v,
        Err(msg) => return Response::new(400, msg),
    };

    let ip = crate::ip::normalize_ip(&crate::extract_client_ip(req));
    let click = ClickRecord {
        id: visits::new_record_id(),
        ts: now,
        ip,
        click_count: payload
            .get("clickCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        time_since_last_click: payload
            .get("timeSinceLastClick")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        element: json_str(&payload, "element").unwrap_or_default(),
        x: payload.get("x").and_then(|v| v.as_i64()).unwrap_or(0),
        y: payload.get("y").and_then(|v| v.as_i64()).unwrap_or(0),
        client_timestamp: json_str(&payload, "timestamp").unwrap_or_default(),
    };
    visits::push_click(store, click, cfg.click_cap);

    json_ok()
}

/// GET /__get-antibot-data. Read-only snapshot of visitors, clicks, and
/// aggregate stats. Admin credentials required; this data maps visitor IPs
/// to reputation metadata and must not be world-readable.
pub fn handle_get_data(req: &Request, store: &impl KeyValueStore) -> Response {
    if req.method() != &Method::Get {
        return Response::new(405, "Method Not Allowed");
    }
    if !crate::auth::is_admin_authorized(req) {
        return Response::new(401, "Unauthorized");
    }

    let visitors = visits::load_visits(store);
    let clicks = visits::load_clicks(store);
    let stats = visits::stats(&visitors, &clicks);
    let body = json!({
        "visitors": visitors,
        "clicks": clicks,
        "stats": stats,
    });
    json_response(200, &body)
}

fn json_ok() -> Response {
    json_response(200, &json!({"success": true}))
}

fn json_response(status: u16, body: &Value) -> Response {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .body(body.to_string())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipinfo::ReputationRecord;
    use crate::test_support::{lock_env, request_with_body, InMemoryStore};
    use spin_sdk::http::Method;

    const NOW: u64 = 1_700_000_000;

    fn cfg() -> Config {
        Config::default()
    }

    fn report_request(ip: &str, body: &str) -> Request {
        request_with_body(
            Method::Post,
            "/__antibot-report",
            &[("content-type", "application/json"), ("x-forwarded-for", ip)],
            body,
        )
    }

    fn seed_server_visit(store: &InMemoryStore, ip: &str, ts: u64) {
        let rep = ReputationRecord::unknown(ip, ts);
        let record = VisitRecord::from_admission(
            &rep,
            VisitStatus::Allowed,
            "Legitimate visitor",
            false,
            0,
            vec![],
            "TestUA",
            "/p",
            "Direct",
            ts,
        );
        visits::push_visit(store, record, 100);
    }

    #[test]
    fn report_merges_into_matching_server_record() {
        let _lock = lock_env();
        std::env::remove_var("FORWARDED_IP_SECRET");
        let store = InMemoryStore::default();
        seed_server_visit(&store, "1.2.3.4", NOW);

        let body = r#"{"status":"ALLOWED","reason":"Client check passed","isBot":false,"ipType":"Residential/ISP","fingerprint":{"screen":"1920x1080x24"}}"#;
        let resp = handle_report_at(&report_request("1.2.3.4", body), &store, &cfg(), NOW + 30);
        assert_eq!(*resp.status(), 200u16);

        let records = visits::load_visits(&store);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].client_status.as_deref(), Some("ALLOWED"));
        assert!(records[0].fingerprint.is_some());
    }

    #[test]
    fn unmatched_report_creates_client_origin_record() {
        let _lock = lock_env();
        std::env::remove_var("FORWARDED_IP_SECRET");
        let store = InMemoryStore::default();
        seed_server_visit(&store, "1.2.3.4", NOW);

        let body = r#"{"status":"BLOCKED","reason":"Client check failed","isBot":true,"userAgent":"python-requests/2.31.0"}"#;
        let resp = handle_report_at(&report_request("5.6.7.8", body), &store, &cfg(), NOW + 10);
        assert_eq!(*resp.status(), 200u16);

        let records = visits::load_visits(&store);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source, RecordSource::Client);
        assert_eq!(records[0].ip, "5.6.7.8");
        // The reported user agent is re-scored server-side.
        assert!(records[0].is_bot);
    }

    #[test]
    fn client_origin_record_reuses_cached_reputation() {
        let _lock = lock_env();
        std::env::remove_var("FORWARDED_IP_SECRET");
        let store = InMemoryStore::default();

        // Seed the reputation cache the way the admission path does.
        let provider = crate::test_support::StubGeoLookup::with_org("AS24940 Hetzner Online GmbH");
        crate::ipinfo::resolve_at(&store, &provider, "5.6.7.8", &cfg(), NOW);

        let body = r#"{"status":"BLOCKED","isBot":false,"userAgent":"TestUA"}"#;
        handle_report_at(&report_request("5.6.7.8", body), &store, &cfg(), NOW + 5);

        let records = visits::load_visits(&store);
        assert_eq!(records[0].source, RecordSource::Client);
        assert_eq!(records[0].org, "AS24940 Hetzner Online GmbH");
        assert_eq!(records[0].isp, "Hetzner Online GmbH");
    }

    #[test]
    fn report_rejects_bad_payloads() {
        let _lock = lock_env();
        std::env::remove_var("FORWARDED_IP_SECRET");
        let store = InMemoryStore::default();

        let resp = handle_report_at(
            &report_request("1.2.3.4", "not json"),
            &store,
            &cfg(),
            NOW,
        );
        assert_eq!(*resp.status(), 400u16);

        let get = crate::test_support::request_with_headers("/__antibot-report", &[]);
        assert_eq!(*handle_report_at(&get, &store, &cfg(), NOW).status(), 405u16);
    }

    #[test]
    fn clicks_are_recorded_and_capped() {
        let _lock = lock_env();
        std::env::remove_var("FORWARDED_IP_SECRET");
        let store = InMemoryStore::default();
        let mut cfg = cfg();
        cfg.click_cap = 3;

        for i in 0..5 {
            let body = format!(
                r#"{{"clickCount":{},"timeSinceLastClick":120,"element":"A","x":1,"y":2,"timestamp":"t"}}"#,
                i
            );
            let req = request_with_body(
                Method::Post,
                "/__track-click",
                &[("x-forwarded-for", "1.2.3.4")],
                &body,
            );
            handle_track_click_at(&req, &store, &cfg, NOW + i);
        }
        let clicks = visits::load_clicks(&store);
        assert_eq!(clicks.len(), 3);
        assert_eq!(clicks[0].click_count, 2);
        assert_eq!(clicks[2].click_count, 4);
    }

    #[test]
    fn data_snapshot_requires_admin_auth() {
        let _lock = lock_env();
        std::env::remove_var("FORWARDED_IP_SECRET");
        std::env::set_var("GATE_API_KEY", "test-admin-key");
        let store = InMemoryStore::default();
        seed_server_visit(&store, "1.2.3.4", NOW);

        let anon = crate::test_support::request_with_headers("/__get-antibot-data", &[]);
        assert_eq!(*handle_get_data(&anon, &store).status(), 401u16);

        let authed = crate::test_support::request_with_headers(
            "/__get-antibot-data",
            &[("authorization", "Bearer test-admin-key")],
        );
        let resp = handle_get_data(&authed, &store);
        assert_eq!(*resp.status(), 200u16);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["stats"]["total_visitors"], 1);
        assert!(body["visitors"].is_array());

        std::env::remove_var("GATE_API_KEY");
    }
}
