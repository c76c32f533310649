// src/metrics.rs
// Prometheus-compatible counters for the admission gate.
// Increments land in an in-memory buffer and flush to KV on thresholds to
// avoid one KV write per request.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::kv::KeyValueStore;

const METRICS_PREFIX: &str = "metrics:";

#[derive(Debug, Clone, Copy)]
pub enum MetricName {
    RequestsTotal,
    AllowedTotal,
    BlockedTotal,
    RateLimitedTotal,
    TokensIssuedTotal,
    TokensRotatedTotal,
    TokensConsumedTotal,
    ReportsTotal,
    ClicksTotal,
    LinksCreatedTotal,
}

impl MetricName {
    fn as_str(&self) -> &'static str {
        match self {
            MetricName::RequestsTotal => "requests_total",
            MetricName::AllowedTotal => "allowed_total",
            MetricName::BlockedTotal => "blocked_total",
            MetricName::RateLimitedTotal => "rate_limited_total",
            MetricName::TokensIssuedTotal => "tokens_issued_total",
            MetricName::TokensRotatedTotal => "tokens_rotated_total",
            MetricName::TokensConsumedTotal => "tokens_consumed_total",
            MetricName::ReportsTotal => "reports_total",
            MetricName::ClicksTotal => "clicks_total",
            MetricName::LinksCreatedTotal => "links_created_total",
        }
    }
}

static METRICS_BUFFER: Lazy<Mutex<HashMap<String, u64>>> = Lazy::new(|| Mutex::new(HashMap::new()));
const FLUSH_KEY_COUNT: usize = 50;
const FLUSH_VALUE_THRESHOLD: u64 = 10;

/// Increment a counter, optionally labeled. Buffered; flushes when one key
/// accumulates enough or the buffer holds too many distinct keys.
pub fn increment(store: &impl KeyValueStore, metric: MetricName, label: Option<&str>) {
    let key = match label {
        Some(l) => format!("{}{}:{}", METRICS_PREFIX, metric.as_str(), l),
        None => format!("{}{}", METRICS_PREFIX, metric.as_str()),
    };

    {
        let mut buf = METRICS_BUFFER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let v = buf.entry(key).or_insert(0);
        *v = v.saturating_add(1);
        if *v < FLUSH_VALUE_THRESHOLD && buf.len() < FLUSH_KEY_COUNT {
            return;
        }
    }
    flush_all(store);
}

/// Drain the buffer into KV. Failed writes are re-buffered for retry.
pub fn flush_all(store: &impl KeyValueStore) {
    let mut to_flush = HashMap::new();
    {
        let mut buf = METRICS_BUFFER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::swap(&mut to_flush, &mut *buf);
    }
    for (k, v) in to_flush.into_iter() {
        let current = get_counter(store, &k);
        let new = current.saturating_add(v);
        if store.set(&k, new.to_string().as_bytes()).is_err() {
            eprintln!("[metrics] failed to write metric {} -> {}", k, new);
            let mut buf = METRICS_BUFFER
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let entry = buf.entry(k).or_insert(0);
            *entry = entry.saturating_add(v);
        }
    }
}

fn get_counter(store: &impl KeyValueStore, key: &str) -> u64 {
    store
        .get(key)
        .ok()
        .flatten()
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn counter_by_name(store: &impl KeyValueStore, name: &str) -> u64 {
    get_counter(store, &format!("{}{}", METRICS_PREFIX, name))
}

/// Prometheus text exposition for the gate's counters.
pub fn render_metrics(store: &impl KeyValueStore) -> String {
    flush_all(store);
    let mut output = String::new();

    output.push_str("# Link admission gate metrics\n");
    for name in &[
        "requests_total",
        "allowed_total",
        "rate_limited_total",
        "tokens_consumed_total",
        "reports_total",
        "clicks_total",
        "links_created_total",
    ] {
        output.push_str(&format!("# TYPE linkgate_{} counter\n", name));
        output.push_str(&format!(
            "linkgate_{} {}\n",
            name,
            counter_by_name(store, name)
        ));
    }

    output.push_str("\n# TYPE linkgate_blocked_total counter\n");
    output.push_str("# HELP linkgate_blocked_total Blocked visits, total and by reason\n");
    output.push_str(&format!(
        "linkgate_blocked_total {}\n",
        counter_by_name(store, "blocked_total")
    ));
    for reason in &["bot", "non_residential"] {
        let count = counter_by_name(store, &format!("blocked_total:{}", reason));
        output.push_str(&format!(
            "linkgate_blocked_total{{reason=\"{}\"}} {}\n",
            reason, count
        ));
    }

    output.push_str("\n# TYPE linkgate_tokens_issued_total counter\n");
    output.push_str(&format!(
        "linkgate_tokens_issued_total {}\n",
        counter_by_name(store, "tokens_issued_total")
    ));
    output.push_str("\n# TYPE linkgate_tokens_rotated_total counter\n");
    for cause in &["used", "expired", "wrong_ip"] {
        let count = counter_by_name(store, &format!("tokens_rotated_total:{}", cause));
        output.push_str(&format!(
            "linkgate_tokens_rotated_total{{cause=\"{}\"}} {}\n",
            cause, count
        ));
    }

    output
}

/// Handle GET /metrics.
pub fn handle_metrics(store: &spin_sdk::key_value::Store) -> spin_sdk::http::Response {
    let body = render_metrics(store);
    spin_sdk::http::Response::builder()
        .status(200)
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(body)
        .build()
}
