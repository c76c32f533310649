// src/input_validation.rs
// Request payload limits and field sanitizers shared by the public and
// admin endpoints.

use percent_encoding::percent_decode_str;
use serde_json::Value;

pub const MAX_ADMIN_JSON_BYTES: usize = 64 * 1024;
pub const MAX_REPORT_BYTES: usize = 16 * 1024;
pub const MAX_CLICK_BYTES: usize = 8 * 1024;
pub const MAX_PATH_ID_LEN: usize = 64;
pub const MAX_EMAIL_LEN: usize = 254;
pub const TOKEN_ID_LEN: usize = 64;

pub fn enforce_body_size(body: &[u8], max_bytes: usize) -> Result<(), &'static str> {
    if body.len() > max_bytes {
        return Err("Payload too large");
    }
    Ok(())
}

pub fn parse_json_body(body: &[u8], max_bytes: usize) -> Result<Value, &'static str> {
    enforce_body_size(body, max_bytes)?;
    serde_json::from_slice::<Value>(body).map_err(|_| "Invalid JSON")
}

/// Gate tokens are exactly 64 lowercase hex characters.
pub fn valid_token_id(token: &str) -> bool {
    token.len() == TOKEN_ID_LEN
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Link path segments: URL-safe, non-empty, bounded.
pub fn valid_path_id(path_id: &str) -> bool {
    !path_id.is_empty()
        && path_id.len() <= MAX_PATH_ID_LEN
        && path_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Minimal shape check for the optional email hint carried on gate links.
/// Not a deliverability check.
pub fn sanitize_email(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_EMAIL_LEN {
        return None;
    }
    if trimmed.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return None;
    }
    let mut parts = trimmed.splitn(2, '@');
    let local = parts.next().unwrap_or("");
    let domain = parts.next().unwrap_or("");
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next()?;
        if k != key {
            return None;
        }
        let raw = parts.next().unwrap_or("");
        Some(percent_decode_str(raw).decode_utf8_lossy().to_string())
    })
}

/// Only http(s) destinations with a host are accepted for links.
pub fn valid_destination_url(url: &str) -> bool {
    let rest = if let Some(r) = url.strip_prefix("https://") {
        r
    } else if let Some(r) = url.strip_prefix("http://") {
        r
    } else {
        return false;
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    !host.is_empty() && !host.chars().any(|c| c.is_whitespace() || c.is_control())
}
