// src/verdict.rs
// Combined admission verdict per IP, cached for a short window so repeated
// requests from the same visitor (page load, asset fetches, reloads) reuse
// one decision instead of re-running the classifier and re-logging a visit.

use serde::{Deserialize, Serialize};

use crate::classify;
use crate::config::Config;
use crate::events::{self, EventKind};
use crate::ipinfo::{self, GeoLookup, ReputationRecord};
use crate::kv::KeyValueStore;
use crate::visits::{self, VisitRecord, VisitStatus};

const VERDICT_PREFIX: &str = "verdict:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub should_block: bool,
    pub reason: String,
    pub computed_at: u64,
    /// The visit record created when this verdict was computed.
    pub visitor: VisitRecord,
}

/// A verdict plus whether it was computed on this request or served from
/// cache. Callers only notify and count on fresh decisions.
#[derive(Debug, Clone)]
pub struct Decision {
    pub verdict: Verdict,
    pub fresh: bool,
}

fn verdict_key(ip: &str) -> String {
    format!("{}{}", VERDICT_PREFIX, ip)
}

/// Return the cached verdict for `ip` when younger than `ttl_seconds`,
/// otherwise run `compute`, cache its result, and return it.
pub fn get_or_compute(
    store: &impl KeyValueStore,
    ip: &str,
    ttl_seconds: u64,
    now: u64,
    compute: impl FnOnce() -> Verdict,
) -> Decision {
    let key = verdict_key(ip);
    if let Some(cached) = crate::kv::get_json::<Verdict>(store, &key) {
        if now.saturating_sub(cached.computed_at) < ttl_seconds {
            return Decision {
                verdict: cached,
                fresh: false,
            };
        }
    }
    let verdict = compute();
    crate::kv::set_json(store, &key, &verdict);
    Decision {
        verdict,
        fresh: true,
    }
}

/// Full server-side admission check: resolve reputation, score the user
/// agent, decide, and record the visit. Cached per IP for the verdict TTL;
/// a cache hit records nothing new.
pub fn check_visitor(
    store: &impl KeyValueStore,
    provider: &impl GeoLookup,
    cfg: &Config,
    ip: &str,
    user_agent: &str,
    page_url: &str,
    referrer: &str,
) -> Decision {
    check_visitor_at(
        store,
        provider,
        cfg,
        ip,
        user_agent,
        page_url,
        referrer,
        crate::now_ts(),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn check_visitor_at(
    store: &impl KeyValueStore,
    provider: &impl GeoLookup,
    cfg: &Config,
    ip: &str,
    user_agent: &str,
    page_url: &str,
    referrer: &str,
    now: u64,
) -> Decision {
    let decision = get_or_compute(store, ip, cfg.verdict_ttl_seconds, now, || {
        let rep = ipinfo::resolve_at(store, provider, ip, cfg, now);
        compute_verdict(&rep, cfg, user_agent, page_url, referrer, now)
    });

    if decision.fresh {
        let v = &decision.verdict;
        visits::push_visit(store, v.visitor.clone(), cfg.visitor_cap);
        let kind = if v.should_block {
            EventKind::VisitBlocked
        } else {
            EventKind::VisitAllowed
        };
        events::log_event(store, kind, ip, &v.reason);
    }
    decision
}

fn compute_verdict(
    rep: &ReputationRecord,
    cfg: &Config,
    user_agent: &str,
    page_url: &str,
    referrer: &str,
    now: u64,
) -> Verdict {
    let (bot_score, bot_reasons) = classify::score_user_agent(user_agent);
    let is_bot = bot_score >= cfg.bot_score_threshold;

    let (should_block, reason) = if is_bot {
        (true, format!("Bot detected: {}", bot_reasons.join(", ")))
    } else if rep.network.is_non_residential() {
        (
            true,
            format!("Non-residential network: {}", rep.network.as_str()),
        )
    } else {
        (false, "Legitimate visitor".to_string())
    };

    let status = if should_block {
        VisitStatus::Blocked
    } else {
        VisitStatus::Allowed
    };
    let visitor = VisitRecord::from_admission(
        rep, status, &reason, is_bot, bot_score, bot_reasons, user_agent, page_url, referrer, now,
    );
    Verdict {
        should_block,
        reason,
        computed_at: now,
        visitor,
    }
}
