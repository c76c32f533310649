// src/rate.rs
// Per-IP request rate limiting over one-minute windows.

use crate::ip;
use crate::kv::KeyValueStore;

fn window_key(site_id: &str, ip: &str, window: u64) -> String {
    // Bucket the IP to bound distinct keys under address churn.
    let bucket = ip::bucket_ip(ip);
    format!("rate:{}:{}:{}", site_id, bucket, window)
}

pub fn current_rate_usage(store: &impl KeyValueStore, site_id: &str, ip: &str) -> u32 {
    current_rate_usage_at(store, site_id, ip, crate::now_ts())
}

pub fn current_rate_usage_at(
    store: &impl KeyValueStore,
    site_id: &str,
    ip: &str,
    now: u64,
) -> u32 {
    let key = window_key(site_id, ip, now / 60);
    store
        .get(&key)
        .ok()
        .flatten()
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0)
}

/// Count one request against the current window; returns false once the
/// window's limit is exhausted. A limit of 0 disables limiting.
pub fn check_rate_limit_at(
    store: &impl KeyValueStore,
    site_id: &str,
    ip: &str,
    limit: u32,
    now: u64,
) -> bool {
    if limit == 0 {
        return true;
    }
    let key = window_key(site_id, ip, now / 60);
    let count = store
        .get(&key)
        .ok()
        .flatten()
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    if count >= limit {
        return false;
    }
    if store.set(&key, (count + 1).to_string().as_bytes()).is_err() {
        eprintln!("[rate] failed to persist counter for key {}", key);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryStore;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn allows_up_to_limit_then_denies() {
        let store = InMemoryStore::default();
        for _ in 0..3 {
            assert!(check_rate_limit_at(&store, "site", "9.9.9.9", 3, NOW));
        }
        assert!(!check_rate_limit_at(&store, "site", "9.9.9.9", 3, NOW));
        assert_eq!(current_rate_usage_at(&store, "site", "9.9.9.9", NOW), 3);
    }

    #[test]
    fn new_window_resets_the_counter() {
        let store = InMemoryStore::default();
        for _ in 0..3 {
            assert!(check_rate_limit_at(&store, "site", "9.9.9.9", 3, NOW));
        }
        assert!(!check_rate_limit_at(&store, "site", "9.9.9.9", 3, NOW));
        assert!(check_rate_limit_at(&store, "site", "9.9.9.9", 3, NOW + 60));
    }

    #[test]
    fn zero_limit_disables_limiting() {
        let store = InMemoryStore::default();
        for _ in 0..100 {
            assert!(check_rate_limit_at(&store, "site", "9.9.9.9", 0, NOW));
        }
    }

    #[test]
    fn nearby_addresses_share_a_bucket() {
        let store = InMemoryStore::default();
        assert!(check_rate_limit_at(&store, "site", "10.0.0.1", 2, NOW));
        assert!(check_rate_limit_at(&store, "site", "10.0.0.200", 2, NOW));
        // Same /24 bucket, so the third request is over the limit.
        assert!(!check_rate_limit_at(&store, "site", "10.0.0.50", 2, NOW));
    }
}
