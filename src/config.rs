// src/config.rs
// Configuration for the link admission gate.
// Loads a per-site JSON blob from the key-value store, with env-provided
// defaults and clamped numeric ranges for every tunable.

use std::env;

use serde::{Deserialize, Serialize};

use crate::kv::KeyValueStore;

pub const TOKEN_TTL_MIN_MINUTES: u64 = 1;
pub const TOKEN_TTL_MAX_MINUTES: u64 = 120;
pub const RATE_LIMIT_MIN: u32 = 1;
pub const RATE_LIMIT_MAX: u32 = 10_000;
pub const VERDICT_TTL_MIN_SECONDS: u64 = 60;
pub const VERDICT_TTL_MAX_SECONDS: u64 = 3_600;
pub const REPUTATION_TTL_MIN_SECONDS: u64 = 300;
pub const REPUTATION_TTL_MAX_SECONDS: u64 = 86_400;
pub const LOOKUP_TIMEOUT_MIN_SECONDS: u64 = 1;
pub const LOOKUP_TIMEOUT_MAX_SECONDS: u64 = 10;
const VISITOR_CAP_MIN: usize = 100;
const VISITOR_CAP_MAX: usize = 50_000;
const CLICK_CAP_MIN: usize = 100;
const CLICK_CAP_MAX: usize = 100_000;
const CORRELATION_WINDOW_MIN_SECONDS: u64 = 5;
const CORRELATION_WINDOW_MAX_SECONDS: u64 = 600;
const BOT_THRESHOLD_MIN: u32 = 1;
const BOT_THRESHOLD_MAX: u32 = 250;

/// Configuration for one gated site, loaded from KV or defaults.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Destination the landing page forwards admitted visitors to.
    #[serde(default = "default_destination_url")]
    pub destination_url: String,
    /// Where blocked visitors are redirected (an innocuous decoy).
    #[serde(default = "default_decoy_url")]
    pub decoy_url: String,
    #[serde(default = "default_token_ttl_minutes")]
    pub token_ttl_minutes: u64,
    /// Per-IP requests per minute before a 429.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Admission verdict cache validity.
    #[serde(default = "default_verdict_ttl_seconds")]
    pub verdict_ttl_seconds: u64,
    /// IP reputation cache validity.
    #[serde(default = "default_reputation_ttl_seconds")]
    pub reputation_ttl_seconds: u64,
    /// Budget for one external geolocation lookup.
    #[serde(default = "default_lookup_timeout_seconds")]
    pub lookup_timeout_seconds: u64,
    /// Aggregate user-agent score at or above which a visitor counts as a bot.
    #[serde(default = "default_bot_score_threshold")]
    pub bot_score_threshold: u32,
    /// Visit records kept before the oldest are evicted.
    #[serde(default = "default_visitor_cap")]
    pub visitor_cap: usize,
    /// Click records kept before the oldest are evicted.
    #[serde(default = "default_click_cap")]
    pub click_cap: usize,
    /// How close (in seconds) a client report must be to a server record
    /// to merge into it instead of creating a new one.
    #[serde(default = "default_correlation_window_seconds")]
    pub correlation_window_seconds: u64,
    /// IPs/CIDRs that bypass the admission check (still go through tokens).
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,
}

const FALLBACK_DESTINATION_URL: &str = "https://example.com/destination";
const FALLBACK_DECOY_URL: &str = "https://www.youtube.com";

fn default_destination_url() -> String {
    env::var("GATE_DESTINATION_URL")
        .ok()
        .filter(|u| crate::input_validation::valid_destination_url(u))
        .unwrap_or_else(|| FALLBACK_DESTINATION_URL.to_string())
}

fn default_decoy_url() -> String {
    env::var("GATE_DECOY_URL")
        .ok()
        .filter(|u| crate::input_validation::valid_destination_url(u))
        .unwrap_or_else(|| FALLBACK_DECOY_URL.to_string())
}

fn default_token_ttl_minutes() -> u64 {
    let v = env::var("GATE_TOKEN_TTL_MIN")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or(10);
    v.clamp(TOKEN_TTL_MIN_MINUTES, TOKEN_TTL_MAX_MINUTES)
}

fn default_rate_limit() -> u32 {
    let v = env::var("GATE_RATE_LIMIT_PER_MIN")
        .ok()
        .and_then(|val| val.parse::<u32>().ok())
        .unwrap_or(60);
    v.clamp(RATE_LIMIT_MIN, RATE_LIMIT_MAX)
}

fn default_verdict_ttl_seconds() -> u64 {
    let v = env::var("GATE_VERDICT_TTL_SECONDS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or(300);
    v.clamp(VERDICT_TTL_MIN_SECONDS, VERDICT_TTL_MAX_SECONDS)
}

fn default_reputation_ttl_seconds() -> u64 {
    let v = env::var("GATE_REPUTATION_TTL_SECONDS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or(3_600);
    v.clamp(REPUTATION_TTL_MIN_SECONDS, REPUTATION_TTL_MAX_SECONDS)
}

fn default_lookup_timeout_seconds() -> u64 {
    let v = env::var("GATE_LOOKUP_TIMEOUT_SECONDS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or(3);
    v.clamp(LOOKUP_TIMEOUT_MIN_SECONDS, LOOKUP_TIMEOUT_MAX_SECONDS)
}

fn default_bot_score_threshold() -> u32 {
    let v = env::var("GATE_BOT_SCORE_THRESHOLD")
        .ok()
        .and_then(|val| val.parse::<u32>().ok())
        .unwrap_or(80);
    v.clamp(BOT_THRESHOLD_MIN, BOT_THRESHOLD_MAX)
}

fn default_visitor_cap() -> usize {
    let v = env::var("GATE_VISITOR_CAP")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(5_000);
    v.clamp(VISITOR_CAP_MIN, VISITOR_CAP_MAX)
}

fn default_click_cap() -> usize {
    let v = env::var("GATE_CLICK_CAP")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(10_000);
    v.clamp(CLICK_CAP_MIN, CLICK_CAP_MAX)
}

fn default_correlation_window_seconds() -> u64 {
    let v = env::var("GATE_CORRELATION_WINDOW_SECONDS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or(60);
    v.clamp(CORRELATION_WINDOW_MIN_SECONDS, CORRELATION_WINDOW_MAX_SECONDS)
}

fn default_whitelist() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Config {
            destination_url: default_destination_url(),
            decoy_url: default_decoy_url(),
            token_ttl_minutes: default_token_ttl_minutes(),
            rate_limit: default_rate_limit(),
            verdict_ttl_seconds: default_verdict_ttl_seconds(),
            reputation_ttl_seconds: default_reputation_ttl_seconds(),
            lookup_timeout_seconds: default_lookup_timeout_seconds(),
            bot_score_threshold: default_bot_score_threshold(),
            visitor_cap: default_visitor_cap(),
            click_cap: default_click_cap(),
            correlation_window_seconds: default_correlation_window_seconds(),
            whitelist: default_whitelist(),
        }
    }
}

impl Config {
    /// Loads config for a site from the key-value store, falling back to
    /// env/defaults when no blob exists. Stored values are re-clamped on
    /// load so a hand-edited blob cannot smuggle out-of-range tunables.
    pub fn load(store: &impl KeyValueStore, site_id: &str) -> Self {
        let key = format!("config:{}", site_id);
        let mut cfg: Config = crate::kv::get_json(store, &key).unwrap_or_default();
        if !crate::input_validation::valid_destination_url(&cfg.destination_url) {
            cfg.destination_url = FALLBACK_DESTINATION_URL.to_string();
        }
        if !crate::input_validation::valid_destination_url(&cfg.decoy_url) {
            cfg.decoy_url = FALLBACK_DECOY_URL.to_string();
        }
        cfg.token_ttl_minutes = cfg
            .token_ttl_minutes
            .clamp(TOKEN_TTL_MIN_MINUTES, TOKEN_TTL_MAX_MINUTES);
        cfg.rate_limit = cfg.rate_limit.clamp(RATE_LIMIT_MIN, RATE_LIMIT_MAX);
        cfg.verdict_ttl_seconds = cfg
            .verdict_ttl_seconds
            .clamp(VERDICT_TTL_MIN_SECONDS, VERDICT_TTL_MAX_SECONDS);
        cfg.reputation_ttl_seconds = cfg
            .reputation_ttl_seconds
            .clamp(REPUTATION_TTL_MIN_SECONDS, REPUTATION_TTL_MAX_SECONDS);
        cfg.lookup_timeout_seconds = cfg
            .lookup_timeout_seconds
            .clamp(LOOKUP_TIMEOUT_MIN_SECONDS, LOOKUP_TIMEOUT_MAX_SECONDS);
        cfg.bot_score_threshold = cfg
            .bot_score_threshold
            .clamp(BOT_THRESHOLD_MIN, BOT_THRESHOLD_MAX);
        cfg.visitor_cap = cfg.visitor_cap.clamp(VISITOR_CAP_MIN, VISITOR_CAP_MAX);
        cfg.click_cap = cfg.click_cap.clamp(CLICK_CAP_MIN, CLICK_CAP_MAX);
        cfg.correlation_window_seconds = cfg
            .correlation_window_seconds
            .clamp(CORRELATION_WINDOW_MIN_SECONDS, CORRELATION_WINDOW_MAX_SECONDS);
        cfg
    }

    pub fn token_ttl_seconds(&self) -> u64 {
        self.token_ttl_minutes * 60
    }
}

/// Admin credential pair from the environment. Returns None when either half
/// is unset, in which case password login is disabled (API key still works).
pub fn admin_credentials() -> Option<(String, String)> {
    let user = env::var("GATE_ADMIN_USER").ok()?;
    let pass = env::var("GATE_ADMIN_PASS").ok()?;
    if user.is_empty() || pass.is_empty() {
        return None;
    }
    Some((user, pass))
}

/// Token for the external geolocation lookup service.
pub fn ipinfo_token() -> Option<String> {
    env::var("GATE_IPINFO_TOKEN").ok().filter(|t| !t.is_empty())
}

/// Notification push credentials (bot token, chat id). None disables pushes.
pub fn telegram_credentials() -> Option<(String, String)> {
    let token = env::var("GATE_TELEGRAM_BOT_TOKEN").ok()?;
    let chat = env::var("GATE_TELEGRAM_CHAT_ID").ok()?;
    if token.is_empty() || chat.is_empty() {
        return None;
    }
    Some((token, chat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{lock_env, InMemoryStore};

    #[test]
    fn defaults_when_store_empty() {
        let _guard = lock_env();
        std::env::remove_var("GATE_TOKEN_TTL_MIN");
        std::env::remove_var("GATE_RATE_LIMIT_PER_MIN");
        let store = InMemoryStore::default();
        let cfg = Config::load(&store, "default");
        assert_eq!(cfg.token_ttl_minutes, 10);
        assert_eq!(cfg.rate_limit, 60);
        assert_eq!(cfg.verdict_ttl_seconds, 300);
        assert_eq!(cfg.reputation_ttl_seconds, 3_600);
        assert_eq!(cfg.visitor_cap, 5_000);
    }

    #[test]
    fn env_override_is_clamped() {
        let _guard = lock_env();
        std::env::set_var("GATE_TOKEN_TTL_MIN", "9999");
        let store = InMemoryStore::default();
        let cfg = Config::load(&store, "default");
        assert_eq!(cfg.token_ttl_minutes, TOKEN_TTL_MAX_MINUTES);
        std::env::remove_var("GATE_TOKEN_TTL_MIN");
    }

    #[test]
    fn stored_blob_is_reclamped_on_load() {
        let _guard = lock_env();
        std::env::remove_var("GATE_TOKEN_TTL_MIN");
        let store = InMemoryStore::default();
        let mut cfg = Config::default();
        cfg.rate_limit = 0;
        cfg.verdict_ttl_seconds = 1;
        crate::kv::set_json(&store, "config:default", &cfg);
        let loaded = Config::load(&store, "default");
        assert_eq!(loaded.rate_limit, RATE_LIMIT_MIN);
        assert_eq!(loaded.verdict_ttl_seconds, VERDICT_TTL_MIN_SECONDS);
    }

    #[test]
    fn invalid_destination_urls_fall_back_to_defaults() {
        let _guard = lock_env();

        // Env value with no scheme is rejected at default time.
        std::env::set_var("GATE_DESTINATION_URL", "javascript:alert(1)");
        let cfg = Config::default();
        assert_eq!(cfg.destination_url, FALLBACK_DESTINATION_URL);
        std::env::remove_var("GATE_DESTINATION_URL");

        // A hand-edited blob cannot smuggle a non-http destination either.
        let store = InMemoryStore::default();
        let mut stored = Config::default();
        stored.destination_url = "file:///etc/passwd".to_string();
        stored.decoy_url = "not a url".to_string();
        crate::kv::set_json(&store, "config:default", &stored);
        let loaded = Config::load(&store, "default");
        assert_eq!(loaded.destination_url, FALLBACK_DESTINATION_URL);
        assert_eq!(loaded.decoy_url, FALLBACK_DECOY_URL);
    }

    #[test]
    fn verdict_window_is_shorter_than_reputation_window() {
        let _guard = lock_env();
        std::env::remove_var("GATE_VERDICT_TTL_SECONDS");
        std::env::remove_var("GATE_REPUTATION_TTL_SECONDS");
        let cfg = Config::default();
        assert!(cfg.verdict_ttl_seconds < cfg.reputation_ttl_seconds);
    }
}
