// src/admin.rs
// Admin endpoints: login, link creation, and the status snapshot.

use serde_json::{json, Value};
use spin_sdk::http::{Method, Request, Response};

use crate::auth;
use crate::config::Config;
use crate::events::{self, EventKind};
use crate::input_validation::{parse_json_body, MAX_ADMIN_JSON_BYTES};
use crate::kv::KeyValueStore;
use crate::links;
use crate::visits;

fn auth_failure_limit() -> u32 {
    std::env::var("GATE_ADMIN_AUTH_FAILURE_LIMIT_PER_MINUTE")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .map(|v| v.clamp(1, 100))
        .unwrap_or(5)
}

fn session_cookie_value(token: &str) -> String {
    format!(
        "{}={}; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age={}",
        auth::session_cookie_name(),
        token,
        auth::session_ttl_seconds()
    )
}

/// POST /admin/login. Checks the single configured credential pair and
/// sets a signed session cookie. Repeated failures from one IP are rate
/// limited before the password check runs.
pub fn handle_admin_login(req: &Request, store: &impl KeyValueStore) -> Response {
    handle_admin_login_at(req, store, crate::now_ts())
}

pub fn handle_admin_login_at(req: &Request, store: &impl KeyValueStore, now: u64) -> Response {
    if req.method() != &Method::Post {
        return Response::new(405, "Method Not Allowed");
    }
    let payload = match parse_json_body(req.body(), MAX_ADMIN_JSON_BYTES) {
        Ok(v) => v,
        Err(msg) => return Response::new(400, msg),
    };
    let username = payload
        .get("username")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let password = payload
        .get("password")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let ip = crate::ip::normalize_ip(&crate::extract_client_ip(req));
    if !auth::verify_admin_login(username, password) {
        if !crate::rate::check_rate_limit_at(store, "admin-auth-fail", &ip, auth_failure_limit(), now)
        {
            return Response::builder()
                .status(429)
                .header("Retry-After", "60")
                .body("Too Many Requests")
                .build();
        }
        return Response::new(401, "Unauthorized");
    }

    let Some(token) = auth::issue_session(username, now) else {
        return Response::new(500, "Session signing unavailable");
    };
    events::log_event(store, EventKind::AdminLogin, &ip, username);

    let body = json!({
        "success": true,
        "expires_at": now + auth::session_ttl_seconds(),
    });
    Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .header("Set-Cookie", session_cookie_value(&token))
        .body(body.to_string())
        .build()
}

/// POST /admin/create-link {landingPage} -> {url}.
pub fn handle_create_link(req: &Request, store: &impl KeyValueStore) -> Response {
    handle_create_link_at(req, store, crate::now_ts())
}

pub fn handle_create_link_at(req: &Request, store: &impl KeyValueStore, now: u64) -> Response {
    if req.method() != &Method::Post {
        return Response::new(405, "Method Not Allowed");
    }
    if !auth::is_admin_authorized(req) {
        return Response::new(401, "Unauthorized");
    }
    let payload = match parse_json_body(req.body(), MAX_ADMIN_JSON_BYTES) {
        Ok(v) => v,
        Err(msg) => return Response::new(400, msg),
    };
    let Some(template) = payload.get("landingPage").and_then(|v| v.as_str()) else {
        return Response::new(400, "Bad Request: landingPage is required");
    };

    let link = match links::create_link(store, template, now) {
        Ok(link) => link,
        Err(msg) => {
            return json_response(400, &json!({"error": msg}));
        }
    };

    let ip = crate::ip::normalize_ip(&crate::extract_client_ip(req));
    events::log_event(store, EventKind::LinkCreated, &ip, &link.template);

    let url = match req.header("host").and_then(|v| v.as_str()) {
        Some(host) => format!("https://{}/{}", host, link.path_id),
        None => format!("/{}", link.path_id),
    };
    json_response(200, &json!({"url": url, "pathId": link.path_id}))
}

/// GET /admin/status. Operational snapshot: store counts, aggregate visit
/// stats, the caller's rate-window usage, and the active configuration.
/// Token and link counts come from the caller because they need a key scan.
pub fn handle_admin_status(
    req: &Request,
    store: &impl KeyValueStore,
    cfg: &Config,
    token_count: usize,
    link_count: usize,
) -> Response {
    if req.method() != &Method::Get {
        return Response::new(405, "Method Not Allowed");
    }
    if !auth::is_admin_authorized(req) {
        return Response::new(401, "Unauthorized");
    }

    let visitors = visits::load_visits(store);
    let clicks = visits::load_clicks(store);
    let stats = visits::stats(&visitors, &clicks);
    let recent_events: Vec<_> = events::load_events(store).into_iter().take(50).collect();
    let ip = crate::ip::normalize_ip(&crate::extract_client_ip(req));

    let body = json!({
        "tokens": token_count,
        "links": link_count,
        "stats": stats,
        "recent_events": recent_events,
        "rate": {
            "limit": cfg.rate_limit,
            "window_used": crate::rate::current_rate_usage(store, "default", &ip),
        },
        "config": cfg,
    });
    json_response(200, &body)
}

fn json_response(status: u16, body: &Value) -> Response {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .body(body.to_string())
        .build()
}
