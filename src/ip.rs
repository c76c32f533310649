// src/ip.rs
// Client IP normalization and bucketing helpers.

use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// Normalize a raw client IP string: trim whitespace and strip the
/// IPv4-mapped-IPv6 prefix proxies commonly prepend.
pub fn normalize_ip(ip: &str) -> String {
    ip.trim().trim_start_matches("::ffff:").to_string()
}

/// Bucket an IP address to reduce key cardinality for rate-limit counters.
///
/// - IPv4: mask to /24 => "a.b.c.0"
/// - IPv6: first four segments => "xxxx:xxxx:xxxx:xxxx::/64"
/// - Fallback: hash the string into one of N buckets => "h{n}"
pub fn bucket_ip(ip: &str) -> String {
    bucket_ip_with_buckets(ip, 1024)
}

pub fn bucket_ip_with_buckets(ip: &str, buckets: u64) -> String {
    if let Ok(addr) = ip.parse::<IpAddr>() {
        match addr {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                return format!("{}.{}.{}.0", o[0], o[1], o[2]);
            }
            IpAddr::V6(v6) => {
                let segs = v6.segments();
                return format!(
                    "{:x}:{:x}:{:x}:{:x}::/64",
                    segs[0], segs[1], segs[2], segs[3]
                );
            }
        }
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    ip.hash(&mut hasher);
    let h = hasher.finish() % buckets;
    format!("h{}", h)
}

/// Returns true if the IP matches a whitelist entry (exact or CIDR).
/// Entries may carry inline comments ("10.0.0.0/8 # office egress").
pub fn is_whitelisted(ip: &str, whitelist: &[String]) -> bool {
    let ip_addr: IpAddr = match ip.parse() {
        Ok(addr) => addr,
        Err(_) => return false,
    };
    for entry in whitelist {
        let entry = entry.split('#').next().unwrap_or("").trim();
        if entry.is_empty() {
            continue;
        }
        if entry == ip {
            return true;
        }
        if let Ok(net) = entry.parse::<ipnet::IpNet>() {
            if net.contains(&ip_addr) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mapped_ipv4() {
        assert_eq!(normalize_ip("::ffff:203.0.113.9"), "203.0.113.9");
        assert_eq!(normalize_ip(" 198.51.100.2 "), "198.51.100.2");
    }

    #[test]
    fn ipv4_buckets_to_slash24() {
        assert_eq!(bucket_ip("1.2.3.4"), "1.2.3.0");
    }

    #[test]
    fn ipv6_buckets_to_prefix() {
        let b = bucket_ip("2001:0db8:85a3:0000:0000:8a2e:0370:7334");
        assert!(b.contains("::/64"));
    }

    #[test]
    fn fallback_hash_is_stable() {
        assert_eq!(
            bucket_ip_with_buckets("not-an-ip", 16),
            bucket_ip_with_buckets("not-an-ip", 16)
        );
    }

    #[test]
    fn whitelist_matches_exact_and_cidr() {
        let wl = vec!["127.0.0.1".to_string(), "10.0.0.0/8 # internal".to_string()];
        assert!(is_whitelisted("127.0.0.1", &wl));
        assert!(is_whitelisted("10.42.1.9", &wl));
        assert!(!is_whitelisted("203.0.113.9", &wl));
    }
}
