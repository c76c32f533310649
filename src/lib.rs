// src/lib.rs
// Entry point for the link admission gate Spin app.

use spin_sdk::http::{Method, Request, Response};
#[cfg(target_family = "wasm")]
use spin_sdk::http_component;
use spin_sdk::key_value::Store;
use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

mod admin; // Admin endpoints (login, link creation, status)
mod auth; // Bearer key and signed session cookies
mod classify; // UA bot scoring and network-origin classification
mod config; // Config loading and defaults
mod events; // Capped operational event log
mod input_validation; // Payload limits and field sanitizers
mod ip; // IP normalization, bucketing, whitelisting
mod ipinfo; // Geo/IP resolution with the hourly cache
mod kv; // Key-value store abstraction
mod links; // Landing link registry and page rendering
mod metrics; // Prometheus counters
mod notify; // Best-effort verdict push
mod rate; // Per-IP rate limiting
mod report; // Client instrumentation endpoints
mod token; // Single-use token lifecycle
mod verdict; // Cached admission verdicts
mod visits; // Visit/click record stores and reconciliation

#[cfg(test)]
mod test_support;

pub(crate) fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true if forwarded IP headers should be trusted for this request.
/// If FORWARDED_IP_SECRET is set, require a matching X-Gate-Forwarded-Secret
/// header.
fn forwarded_ip_trusted(req: &Request) -> bool {
    match env::var("FORWARDED_IP_SECRET") {
        Ok(secret) => req
            .header("x-gate-forwarded-secret")
            .and_then(|v| v.as_str())
            .map(|v| v == secret)
            .unwrap_or(false),
        Err(_) => true,
    }
}

/// Extract the best available client IP from the request.
pub(crate) fn extract_client_ip(req: &Request) -> String {
    if forwarded_ip_trusted(req) {
        if let Some(h) = req.header("x-forwarded-for") {
            let val = h.as_str().unwrap_or("");
            // First IP in the list is the original client.
            if let Some(ip) = val.split(',').next() {
                let ip = ip.trim();
                if !ip.is_empty() && ip != "unknown" {
                    return ip.to_string();
                }
            }
        }
        if let Some(h) = req.header("x-real-ip") {
            let val = h.as_str().unwrap_or("");
            if !val.is_empty() && val != "unknown" {
                return val.to_string();
            }
        }
    }
    "unknown".to_string()
}

fn user_agent(req: &Request) -> &str {
    req.header("user-agent")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn redirect(location: &str) -> Response {
    Response::builder()
        .status(302)
        .header("Location", location)
        .header("Cache-Control", "no-store")
        .body(Vec::new())
        .build()
}

/// Append the query fragment pointing a visitor back at the same link with
/// a fresh token.
fn reissue_location(path_id: &str, token: &str, email: Option<&str>) -> String {
    match email {
        Some(email) => format!(
            "/{}?token={}&email={}",
            path_id,
            token,
            percent_encoding::utf8_percent_encode(email, percent_encoding::NON_ALPHANUMERIC)
        ),
        None => format!("/{}?token={}", path_id, token),
    }
}

/// Per-IP throttle applied before route dispatch, so every store-backed
/// endpoint shares one budget. Whitelisted IPs bypass.
fn throttle(
    store: &impl kv::KeyValueStore,
    cfg: &config::Config,
    ip: &str,
    path: &str,
) -> Option<Response> {
    throttle_at(store, cfg, ip, path, now_ts())
}

fn throttle_at(
    store: &impl kv::KeyValueStore,
    cfg: &config::Config,
    ip: &str,
    path: &str,
    now: u64,
) -> Option<Response> {
    if ip::is_whitelisted(ip, &cfg.whitelist) {
        return None;
    }
    if rate::check_rate_limit_at(store, "default", ip, cfg.rate_limit, now) {
        return None;
    }
    events::log_event(store, events::EventKind::RateLimited, ip, path);
    Some(
        Response::builder()
            .status(429)
            .header("Retry-After", "60")
            .body("Too Many Requests")
            .build(),
    )
}

#[cfg(target_family = "wasm")]
fn open_default_store() -> Result<Store, spin_sdk::key_value::Error> {
    Store::open_default()
}

// Off the Spin runtime the SDK's store stub panics instead of returning Err;
// map that onto the same "store unavailable" path the handler already has.
#[cfg(not(target_family = "wasm"))]
fn open_default_store() -> Result<Store, spin_sdk::key_value::Error> {
    std::panic::catch_unwind(Store::open_default)
        .unwrap_or(Err(spin_sdk::key_value::Error::NoSuchStore))
}

fn kv_error_response() -> Response {
    Response::builder()
        .status(500)
        .header("X-KV-Status", "unavailable")
        .body("Key-value store error")
        .build()
}

fn handle_health(req: &Request) -> Response {
    let allowed = ["127.0.0.1", "::1"];
    let ip = ip::normalize_ip(&extract_client_ip(req));
    if !allowed.contains(&ip.as_str()) {
        return Response::new(403, "Forbidden");
    }
    if let Ok(store) = open_default_store() {
        let test_key = "health:test";
        let _ = store.set(test_key, b"ok");
        let ok = store.get(test_key).is_ok();
        let _ = store.delete(test_key);
        if ok {
            return Response::builder()
                .status(200)
                .header("X-KV-Status", "available")
                .body("OK")
                .build();
        }
    }
    println!("[health] key-value store unavailable");
    kv_error_response()
}

/// The gated entry point: admission check first, then the token state
/// machine, then the landing page.
fn handle_gated_link(
    req: &Request,
    store: &Store,
    cfg: &config::Config,
    link: &links::LandingLink,
    ip: &str,
) -> Response {
    let query = req.query();
    let presented = input_validation::query_param(query, "token")
        .filter(|t| input_validation::valid_token_id(t));
    let email = input_validation::query_param(query, "email")
        .and_then(|e| input_validation::sanitize_email(&e));

    let whitelisted = ip::is_whitelisted(ip, &cfg.whitelist);
    if !whitelisted {
        let page_url = format!("/{}", link.path_id);
        let referrer = req
            .header("referer")
            .and_then(|v| v.as_str())
            .unwrap_or("Direct");
        let decision = verdict::check_visitor(
            store,
            &ipinfo::SpinGeoLookup,
            cfg,
            ip,
            user_agent(req),
            &page_url,
            referrer,
        );
        if decision.fresh {
            if decision.verdict.should_block {
                let reason = if decision.verdict.visitor.is_bot {
                    "bot"
                } else {
                    "non_residential"
                };
                metrics::increment(store, metrics::MetricName::BlockedTotal, None);
                metrics::increment(store, metrics::MetricName::BlockedTotal, Some(reason));
            } else {
                metrics::increment(store, metrics::MetricName::AllowedTotal, None);
            }
            notify::notify_visit(&decision.verdict.visitor);
        }
        if decision.verdict.should_block {
            return redirect(&cfg.decoy_url);
        }
    }

    match token::evaluate(store, presented.as_deref(), ip, cfg.token_ttl_seconds()) {
        token::TokenOutcome::Serve => {
            metrics::increment(store, metrics::MetricName::TokensConsumedTotal, None);
            let html = links::render_landing(link, &cfg.destination_url, email.as_deref());
            Response::builder()
                .status(200)
                .header("Content-Type", "text/html; charset=utf-8")
                .header("Cache-Control", "no-store")
                .body(html)
                .build()
        }
        token::TokenOutcome::Reissue { token, cause } => {
            if cause == token::ReissueCause::Missing || cause == token::ReissueCause::Unknown {
                metrics::increment(store, metrics::MetricName::TokensIssuedTotal, None);
            } else {
                metrics::increment(
                    store,
                    metrics::MetricName::TokensRotatedTotal,
                    Some(cause.as_str()),
                );
            }
            let kind = if cause == token::ReissueCause::Missing {
                events::EventKind::TokenIssued
            } else {
                events::EventKind::TokenRotated
            };
            events::log_event(store, kind, ip, cause.as_str());
            redirect(&reissue_location(&link.path_id, &token, email.as_deref()))
        }
    }
}

/// Main handler, testable as a plain Rust function.
pub fn handle_gate_impl(req: &Request) -> Response {
    let path = req.path();

    if path == "/health" {
        return handle_health(req);
    }

    let Ok(store) = open_default_store() else {
        println!("[kv] store unavailable during request handling");
        return kv_error_response();
    };

    if path == "/metrics" {
        return metrics::handle_metrics(&store);
    }

    let cfg = config::Config::load(&store, "default");
    let ip = ip::normalize_ip(&extract_client_ip(req));

    // Expired-entry cleanup rides along with request handling.
    ipinfo::maybe_sweep_cache(&store, &cfg);
    token::maybe_prune(&store);

    metrics::increment(&store, metrics::MetricName::RequestsTotal, None);

    if let Some(resp) = throttle(&store, &cfg, &ip, path) {
        metrics::increment(&store, metrics::MetricName::RateLimitedTotal, None);
        return resp;
    }

    match path {
        "/admin/login" => return admin::handle_admin_login(req, &store),
        "/admin/create-link" => {
            let resp = admin::handle_create_link(req, &store);
            if *resp.status() == 200u16 {
                metrics::increment(&store, metrics::MetricName::LinksCreatedTotal, None);
            }
            return resp;
        }
        "/admin/status" => {
            let tokens = token::count_tokens(&store);
            let links = links::count_links(&store);
            return admin::handle_admin_status(req, &store, &cfg, tokens, links);
        }
        "/__antibot-report" => {
            metrics::increment(&store, metrics::MetricName::ReportsTotal, None);
            return report::handle_report(req, &store, &cfg);
        }
        "/__track-click" => {
            metrics::increment(&store, metrics::MetricName::ClicksTotal, None);
            return report::handle_track_click(req, &store, &cfg);
        }
        "/__get-antibot-data" => return report::handle_get_data(req, &store),
        "/config" => return handle_config(req, &cfg),
        "/redirect" => return handle_redirect(req, &cfg),
        _ => {}
    }

    let path_id = path.trim_start_matches('/');
    if let Some(link) = links::lookup(&store, path_id) {
        return handle_gated_link(req, &store, &cfg, &link, &ip);
    }

    // Not a tracked link.
    Response::new(404, "Not Found")
}

/// GET /config: the destination the instrumentation forwards to, with the
/// optional email hint as a fragment.
fn handle_config(req: &Request, cfg: &config::Config) -> Response {
    if req.method() != &Method::Get {
        return Response::new(405, "Method Not Allowed");
    }
    let email = input_validation::query_param(req.query(), "email")
        .and_then(|e| input_validation::sanitize_email(&e));
    let url = match email {
        Some(email) => format!("{}#{}", cfg.destination_url, email),
        None => cfg.destination_url.clone(),
    };
    Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .body(serde_json::json!({ "destination_url": url }).to_string())
        .build()
}

/// GET /redirect: immediate 302 to the destination.
fn handle_redirect(req: &Request, cfg: &config::Config) -> Response {
    if req.method() != &Method::Get {
        return Response::new(405, "Method Not Allowed");
    }
    let email = input_validation::query_param(req.query(), "email")
        .and_then(|e| input_validation::sanitize_email(&e));
    let url = match email {
        Some(email) => format!("{}#{}", cfg.destination_url, email),
        None => cfg.destination_url.clone(),
    };
    redirect(&url)
}

#[cfg(target_family = "wasm")]
#[http_component]
pub fn spin_entrypoint(req: Request) -> Response {
    handle_gate_impl(&req)
}
