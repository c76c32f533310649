// src/token.rs
// Single-use access token lifecycle: issue, validate, rotate, consume.
// A token authorizes exactly one content delivery, bound to the issuing IP
// and a short TTL. Anything else forces a fresh issuance cycle, which
// re-runs the admission check upstream.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use spin_sdk::key_value::Store;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::kv::KeyValueStore;

const TOKEN_PREFIX: &str = "token:";
// Consumed and expired tokens are kept for a day for the status endpoint,
// then pruned to bound KV growth.
const PRUNE_AFTER_SECONDS: u64 = 86_400;

/// One issued token. No explicit expired state is stored; expiry is
/// computed on read from `created_at` and `ttl_seconds`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TokenRecord {
    pub created_at: u64,
    pub ip: String,
    pub ttl_seconds: u64,
    pub consumed: bool,
}

impl TokenRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) > self.ttl_seconds
    }
}

/// Why a presented token was not honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReissueCause {
    Missing,
    Unknown,
    Consumed,
    Expired,
    WrongIp,
}

impl ReissueCause {
    pub fn as_str(self) -> &'static str {
        match self {
            ReissueCause::Missing => "missing",
            ReissueCause::Unknown => "unknown",
            ReissueCause::Consumed => "used",
            ReissueCause::Expired => "expired",
            ReissueCause::WrongIp => "wrong_ip",
        }
    }
}

/// Outcome of evaluating a presented token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    /// Token was valid and has now been consumed; serve the content.
    Serve,
    /// Redirect the visitor back to the link carrying the fresh token.
    Reissue { token: String, cause: ReissueCause },
}

fn token_key(id: &str) -> String {
    format!("{}{}", TOKEN_PREFIX, id)
}

/// 32 random bytes as lowercase hex.
fn new_token_id() -> String {
    let mut rng = rand::rng();
    use rand::Rng as _;
    format!(
        "{:016x}{:016x}{:016x}{:016x}",
        rng.random::<u64>(),
        rng.random::<u64>(),
        rng.random::<u64>(),
        rng.random::<u64>()
    )
}

fn load(store: &impl KeyValueStore, id: &str) -> Option<TokenRecord> {
    crate::kv::get_json(store, &token_key(id))
}

fn save(store: &impl KeyValueStore, id: &str, record: &TokenRecord) {
    crate::kv::set_json(store, &token_key(id), record);
}

fn mint(store: &impl KeyValueStore, ip: &str, ttl_seconds: u64, now: u64) -> String {
    let id = new_token_id();
    let record = TokenRecord {
        created_at: now,
        ip: ip.to_string(),
        ttl_seconds,
        consumed: false,
    };
    save(store, &id, &record);
    id
}

/// Consume the old token and issue its replacement as one transition.
fn rotate(
    store: &impl KeyValueStore,
    old_id: &str,
    mut old: TokenRecord,
    ip: &str,
    ttl_seconds: u64,
    now: u64,
    cause: ReissueCause,
) -> TokenOutcome {
    if !old.consumed {
        old.consumed = true;
        save(store, old_id, &old);
    }
    let new_id = mint(store, ip, ttl_seconds, now);
    TokenOutcome::Reissue {
        token: new_id,
        cause,
    }
}

/// Evaluate a presented token for the requesting IP.
///
/// - No token, or a token the store does not know: mint one bound to this
///   IP and instruct the first-touch redirect.
/// - Consumed, expired, or bound to a different IP: mark the presented
///   token consumed and rotate.
/// - Known, unconsumed, unexpired, IP matches: consume and serve.
pub fn evaluate(
    store: &impl KeyValueStore,
    presented: Option<&str>,
    ip: &str,
    ttl_seconds: u64,
) -> TokenOutcome {
    evaluate_at(store, presented, ip, ttl_seconds, now_ts())
}

pub fn evaluate_at(
    store: &impl KeyValueStore,
    presented: Option<&str>,
    ip: &str,
    ttl_seconds: u64,
    now: u64,
) -> TokenOutcome {
    let Some(id) = presented.filter(|t| !t.is_empty()) else {
        let token = mint(store, ip, ttl_seconds, now);
        return TokenOutcome::Reissue {
            token,
            cause: ReissueCause::Missing,
        };
    };

    let Some(record) = load(store, id) else {
        let token = mint(store, ip, ttl_seconds, now);
        return TokenOutcome::Reissue {
            token,
            cause: ReissueCause::Unknown,
        };
    };

    if record.consumed {
        return rotate(store, id, record, ip, ttl_seconds, now, ReissueCause::Consumed);
    }
    if record.is_expired(now) {
        return rotate(store, id, record, ip, ttl_seconds, now, ReissueCause::Expired);
    }
    if record.ip != ip {
        return rotate(store, id, record, ip, ttl_seconds, now, ReissueCause::WrongIp);
    }

    let mut consumed = record;
    consumed.consumed = true;
    save(store, id, &consumed);
    TokenOutcome::Serve
}

// Prune gate, same ride-along pattern as the reputation cache sweep.
static LAST_PRUNE_HOUR: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(0));

/// Drop token records older than a day. At most once per hour.
pub fn maybe_prune(store: &Store) {
    let now = now_ts();
    let hour = now / 3600;
    {
        let mut last = LAST_PRUNE_HOUR
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
    let mut pruned = 0usize;
    for key in keys {
        if !key.starts_with(TOKEN_PREFIX) {
            continue;
        }
        match crate::kv::get_json::<TokenRecord>(store, &key) {
            Some(rec) if now.saturating_sub(rec.created_at) <= PRUNE_AFTER_SECONDS => {}
            _ => {
                let _ = KeyValueStore::delete(store, &key);
                pruned += 1;
            }
        }
    }
    if pruned > 0 {
        println!("[token] pruned {} stale token records", pruned);
    }
}

/// Count of token records currently in the store (status endpoint).
pub fn count_tokens(store: &Store) -> usize {
    store
        .get_keys()
        .map(|keys| keys.iter().filter(|k| k.starts_with(TOKEN_PREFIX)).count())
        .unwrap_or(0)
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
