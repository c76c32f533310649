// src/ipinfo.rs
// Geo/IP resolution with a one-hour KV cache over an external lookup
// service. Lookup failures degrade to an "Unknown" record so the admission
// path never stalls or errors on a flaky upstream.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use spin_sdk::http::{Method, Request, Response};
use spin_sdk::key_value::Store;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::classify::{classify_network, NetworkType};
use crate::config::Config;
use crate::kv::KeyValueStore;

const CACHE_PREFIX: &str = "ipcache:";
const IPINFO_BASE_URL: &str = "https://ipinfo.io";

/// Raw payload shape of the external lookup service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoApiResponse {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub loc: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub postal: String,
    #[serde(default)]
    pub timezone: String,
}

/// Cached per-IP reputation metadata plus the derived network class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub ip: String,
    pub hostname: String,
    pub city: String,
    pub region: String,
    pub country: String,
    pub country_name: String,
    pub loc: String,
    pub org: String,
    pub isp: String,
    pub asn: Option<String>,
    pub timezone: String,
    pub network: NetworkType,
    pub fetched_at: u64,
}

impl ReputationRecord {
    pub fn from_api(ip: &str, api: GeoApiResponse, now: u64) -> Self {
        let asn = extract_asn(&api.org);
        let network = classify_network(&api.org, asn.as_deref(), &api.hostname);
        ReputationRecord {
            ip: if api.ip.is_empty() { ip.to_string() } else { api.ip },
            hostname: api.hostname,
            city: or_unknown(api.city),
            region: or_unknown(api.region),
            country_name: country_name(&api.country),
            country: or_unknown(api.country),
            loc: api.loc,
            isp: isp_from_org(&api.org),
            org: or_unknown(api.org),
            asn,
            timezone: api.timezone,
            network,
            fetched_at: now,
        }
    }

    /// Degraded record for a failed lookup: every field "Unknown", network
    /// unclassified. Unclassified is not non-residential, so the visitor
    /// falls through to the default allow unless another signal fires.
    pub fn unknown(ip: &str, now: u64) -> Self {
        ReputationRecord {
            ip: ip.to_string(),
            hostname: String::new(),
            city: "Unknown".to_string(),
            region: "Unknown".to_string(),
            country: "Unknown".to_string(),
            country_name: "Unknown".to_string(),
            loc: String::new(),
            org: "Unknown".to_string(),
            isp: "Unknown".to_string(),
            asn: None,
            timezone: String::new(),
            network: NetworkType::Unknown,
            fetched_at: now,
        }
    }
}

fn or_unknown(v: String) -> String {
    if v.is_empty() {
        "Unknown".to_string()
    } else {
        v
    }
}

/// Pull "AS<digits>" from the front of an org string ("AS15169 Google LLC").
pub fn extract_asn(org: &str) -> Option<String> {
    let first = org.split_whitespace().next()?;
    let digits = first.strip_prefix("AS")?;
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(digits.to_string())
    } else {
        None
    }
}

/// Everything after the AS-number prefix, or the whole org when no prefix.
pub fn isp_from_org(org: &str) -> String {
    if org.is_empty() {
        return "Unknown".to_string();
    }
    match extract_asn(org) {
        Some(_) => org
            .split_whitespace()
            .skip(1)
            .collect::<Vec<_>>()
            .join(" "),
        None => org.to_string(),
    }
}

/// Map a two-letter country code to its display name, falling back to the
/// code itself for anything outside the fixed table.
pub fn country_name(code: &str) -> String {
    let name = match code {
        "US" => "United States",
        "GB" => "United Kingdom",
        "CA" => "Canada",
        "AU" => "Australia",
        "DE" => "Germany",
        "FR" => "France",
        "IT" => "Italy",
        "ES" => "Spain",
        "NL" => "Netherlands",
        "SE" => "Sweden",
        "NO" => "Norway",
        "DK" => "Denmark",
        "FI" => "Finland",
        "PL" => "Poland",
        "RU" => "Russia",
        "CN" => "China",
        "JP" => "Japan",
        "KR" => "South Korea",
        "IN" => "India",
        "BR" => "Brazil",
        "MX" => "Mexico",
        "AR" => "Argentina",
        "NG" => "Nigeria",
        "ZA" => "South Africa",
        "EG" => "Egypt",
        "SA" => "Saudi Arabia",
        "" => "Unknown",
        other => return other.to_string(),
    };
    name.to_string()
}

/// The external lookup capability, stubbed in tests.
pub trait GeoLookup {
    fn lookup(&self, ip: &str, timeout_seconds: u64) -> Result<GeoApiResponse, String>;
}

/// Production lookup over Spin outbound HTTP. The Spin runtime bounds the
/// outbound request; a wall-clock deadline check catches overruns the
/// runtime let through and degrades them like any transport error.
pub struct SpinGeoLookup;

impl GeoLookup for SpinGeoLookup {
    fn lookup(&self, ip: &str, timeout_seconds: u64) -> Result<GeoApiResponse, String> {
        let url = match crate::config::ipinfo_token() {
            Some(token) => format!("{}/{}?token={}", IPINFO_BASE_URL, ip, token),
            None => format!("{}/{}", IPINFO_BASE_URL, ip),
        };
        let mut builder = Request::builder();
        builder
            .method(Method::Get)
            .uri(&url)
            .header("accept", "application/json");
        let request = builder.build();

        let started = now_ts();
        let response: Response = spin_sdk::http::run(spin_sdk::http::send(request))
            .map_err(|e| format!("transport error ({:?})", e))?;
        if now_ts().saturating_sub(started) > timeout_seconds {
            return Err(format!("lookup exceeded {}s budget", timeout_seconds));
        }
        if *response.status() != 200u16 {
            return Err(format!("upstream status {}", response.status()));
        }
        serde_json::from_slice::<GeoApiResponse>(response.body())
            .map_err(|_| "malformed upstream payload".to_string())
    }
}

fn cache_key(ip: &str) -> String {
    format!("{}{}", CACHE_PREFIX, ip)
}

/// Cached reputation for `ip`, regardless of age. None when never fetched.
pub fn cached_record(store: &impl KeyValueStore, ip: &str) -> Option<ReputationRecord> {
    crate::kv::get_json(store, &cache_key(ip))
}

/// Resolve an IP to its reputation record. Cache hits younger than the
/// configured TTL are returned without touching the provider; misses fetch,
/// classify, and overwrite the cache entry unconditionally. Failures return
/// a degraded record and cache nothing, so the next visit retries.
pub fn resolve(
    store: &impl KeyValueStore,
    provider: &impl GeoLookup,
    ip: &str,
    cfg: &Config,
) -> ReputationRecord {
    resolve_at(store, provider, ip, cfg, now_ts())
}

pub fn resolve_at(
    store: &impl KeyValueStore,
    provider: &impl GeoLookup,
    ip: &str,
    cfg: &Config,
    now: u64,
) -> ReputationRecord {
    if let Some(rec) = cached_record(store, ip) {
        if now.saturating_sub(rec.fetched_at) < cfg.reputation_ttl_seconds {
            return rec;
        }
    }
    match provider.lookup(ip, cfg.lookup_timeout_seconds) {
        Ok(api) => {
            let rec = ReputationRecord::from_api(ip, api, now);
            crate::kv::set_json(store, &cache_key(ip), &rec);
            rec
        }
        Err(e) => {
            eprintln!("[ipinfo] lookup failed for {}: {}", ip, e);
            crate::events::log_event(store, crate::events::EventKind::LookupDegraded, ip, &e);
            ReputationRecord::unknown(ip, now)
        }
    }
}

// Sweep gate. Spin has no detached background tasks, so expired-entry
// cleanup rides along with request handling at most once per hour.
static LAST_SWEEP_HOUR: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(0));

/// Remove cache entries older than the reputation TTL, bounding KV growth
/// independent of request volume. Runs at most once per hour.
pub fn maybe_sweep_cache(store: &Store, cfg: &Config) {
    let now = now_ts();
    let hour = now / 3600;
    {
        let mut last = LAST_SWEEP_HOUR
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == hour {
            return;
        }
        *last = hour;
    }
    let Ok(keys) = store.get_keys() else {
        return;
    };
    let mut removed = 0usize;
    let mut kept = 0usize;
    for key in keys {
        if !key.starts_with(CACHE_PREFIX) {
            continue;
        }
        match crate::kv::get_json::<ReputationRecord>(store, &key) {
            Some(rec) if now.saturating_sub(rec.fetched_at) < cfg.reputation_ttl_seconds => {
                kept += 1;
            }
            _ => {
                let _ = KeyValueStore::delete(store, &key);
                removed += 1;
            }
        }
    }
    println!("[ipinfo] cache sweep: {} kept, {} removed", kept, removed);
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{InMemoryStore, StubGeoLookup};

    fn cfg() -> Config {
        Config::default()
    }

    #[test]
    fn extracts_asn_and_isp_from_org() {
        assert_eq!(extract_asn("AS15169 Google LLC"), Some("15169".to_string()));
        assert_eq!(extract_asn("Google LLC"), None);
        assert_eq!(extract_asn("ASN bad"), None);
        assert_eq!(isp_from_org("AS15169 Google LLC"), "Google LLC");
        assert_eq!(isp_from_org("Plain Org"), "Plain Org");
        assert_eq!(isp_from_org(""), "Unknown");
    }

    #[test]
    fn cached_record_skips_provider_within_ttl() {
        let store = InMemoryStore::default();
        let provider = StubGeoLookup::with_org("AS24940 Hetzner Online GmbH");
        let now = 1_000_000;

        let first = resolve_at(&store, &provider, "203.0.113.7", &cfg(), now);
        assert_eq!(provider.calls(), 1);
        assert_eq!(first.asn.as_deref(), Some("24940"));

        // Younger than one hour: no second upstream call, same record.
        let second = resolve_at(&store, &provider, "203.0.113.7", &cfg(), now + 3_599);
        assert_eq!(provider.calls(), 1);
        assert_eq!(second.fetched_at, first.fetched_at);
        assert_eq!(second.org, first.org);
    }

    #[test]
    fn expired_record_is_refetched_and_overwritten() {
        let store = InMemoryStore::default();
        let provider = StubGeoLookup::with_org("AS24940 Hetzner Online GmbH");
        let now = 1_000_000;

        resolve_at(&store, &provider, "203.0.113.7", &cfg(), now);
        let refreshed = resolve_at(&store, &provider, "203.0.113.7", &cfg(), now + 3_601);
        assert_eq!(provider.calls(), 2);
        assert_eq!(refreshed.fetched_at, now + 3_601);
    }

    #[test]
    fn failed_lookup_degrades_and_is_not_cached() {
        let store = InMemoryStore::default();
        let provider = StubGeoLookup::failing();
        let now = 1_000_000;

        let rec = resolve_at(&store, &provider, "203.0.113.7", &cfg(), now);
        assert_eq!(rec.org, "Unknown");
        assert_eq!(rec.network, NetworkType::Unknown);
        assert!(!rec.network.is_non_residential());

        // Next resolve retries instead of serving the degraded record.
        resolve_at(&store, &provider, "203.0.113.7", &cfg(), now + 1);
        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn classification_is_derived_at_fetch_time() {
        let store = InMemoryStore::default();
        let provider = StubGeoLookup::with_org("AS202425 NordVPN");
        let rec = resolve_at(&store, &provider, "198.51.100.4", &cfg(), 5);
        assert_eq!(rec.network, NetworkType::VpnProxy);
        assert!(rec.network.is_vpn());
    }

    #[test]
    fn country_names_map_known_codes() {
        assert_eq!(country_name("US"), "United States");
        assert_eq!(country_name("XX"), "XX");
        assert_eq!(country_name(""), "Unknown");
    }
}
