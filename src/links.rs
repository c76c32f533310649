// src/links.rs
// Landing link registry: opaque path identifiers mapped to a named page
// template, created by admin action and looked up on every request. Also
// renders the landing page with the client instrumentation injected.

use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::kv::KeyValueStore;

const LINK_PREFIX: &str = "link:";

/// Page templates an admin may attach a link to. Fixed at build time;
/// anything else is rejected at creation.
pub const TEMPLATES: &[&str] = &["landing", "download", "notice", "promo"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandingLink {
    pub path_id: String,
    pub template: String,
    pub created_at: u64,
}

fn link_key(path_id: &str) -> String {
    format!("{}{}", LINK_PREFIX, path_id)
}

pub fn is_known_template(name: &str) -> bool {
    TEMPLATES.contains(&name)
}

fn new_path_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

/// Register a new link for `template`. Links are immutable once created.
pub fn create_link(
    store: &impl KeyValueStore,
    template: &str,
    now: u64,
) -> Result<LandingLink, &'static str> {
    if !is_known_template(template) {
        return Err("Unknown landing page template");
    }
    let link = LandingLink {
        path_id: new_path_id(),
        template: template.to_string(),
        created_at: now,
    };
    crate::kv::set_json(store, &link_key(&link.path_id), &link);
    Ok(link)
}

/// Look a path segment up in the registry. None means this path is not a
/// tracked link and falls through to ordinary handling.
pub fn lookup(store: &impl KeyValueStore, path_id: &str) -> Option<LandingLink> {
    if !crate::input_validation::valid_path_id(path_id) {
        return None;
    }
    crate::kv::get_json(store, &link_key(path_id))
}

/// Count of registered links (status endpoint).
pub fn count_links(store: &spin_sdk::key_value::Store) -> usize {
    store
        .get_keys()
        .map(|keys| keys.iter().filter(|k| k.starts_with(LINK_PREFIX)).count())
        .unwrap_or(0)
}

/// Render the landing page for an admitted visitor: the template shell with
/// the instrumentation script and destination wired in.
pub fn render_landing(link: &LandingLink, destination_url: &str, email: Option<&str>) -> String {
    let (title, heading, message) = match link.template.as_str() {
        "download" => (
            "Your download",
            "Preparing your download",
            "Your file will be ready in a moment.",
        ),
        "notice" => (
            "Service notice",
            "One moment",
            "We are checking your connection before continuing.",
        ),
        "promo" => (
            "Special offer",
            "Almost there",
            "Taking you to the offer page.",
        ),
        _ => (
            "Redirecting",
            "One moment",
            "Taking you to your destination.",
        ),
    };

    let destination = if let Some(email) = email {
        let sep = if destination_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}email={}",
            destination_url,
            sep,
            percent_encoding::utf8_percent_encode(email, percent_encoding::NON_ALPHANUMERIC)
        )
    } else {
        destination_url.to_string()
    };

    LANDING_SHELL
        .replace("{{TITLE}}", title)
        .replace("{{HEADING}}", heading)
        .replace("{{MESSAGE}}", message)
        .replace("{{SCRIPT}}", INSTRUMENTATION_SCRIPT)
        .replace("{{DESTINATION_URL}}", &destination)
}

const LANDING_SHELL: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <meta name="robots" content="noindex, nofollow">
  <title>{{TITLE}}</title>
  <style>
    body { font-family: sans-serif; background: #f9f9f9; margin: 2em; }
    .gate-container { background: #fff; padding: 2em; border-radius: 8px; box-shadow: 0 2px 8px #ccc; max-width: 480px; margin: auto; text-align: center; }
    .spinner { margin: 1.5em auto; width: 32px; height: 32px; border: 4px solid #eee; border-top-color: #36c; border-radius: 50%; animation: spin 0.8s linear infinite; }
    @keyframes spin { to { transform: rotate(360deg); } }
  </style>
</head>
<body>
  <div class="gate-container">
    <h1>{{HEADING}}</h1>
    <div class="spinner"></div>
    <p>{{MESSAGE}}</p>
  </div>
  <script>
{{SCRIPT}}
  </script>
</body>
</html>
"#;

// Client-side advisory check. Its verdict is reported back and merged into
// the server record but never overrides the server decision.
const INSTRUMENTATION_SCRIPT: &str = r#"(function () {
  var DESTINATION = "{{DESTINATION_URL}}";

  function clientCheck() {
    var reasons = [];
    if (navigator.webdriver) { reasons.push("webdriver flag"); }
    if (!navigator.languages || navigator.languages.length === 0) { reasons.push("no languages"); }
    if (window.outerWidth === 0 && window.outerHeight === 0) { reasons.push("zero outer window"); }
    if (/HeadlessChrome/.test(navigator.userAgent)) { reasons.push("headless chrome ua"); }
    return { isBot: reasons.length > 0, reason: reasons.join(", ") };
  }

  function fingerprint() {
    return {
      screen: screen.width + "x" + screen.height + "x" + screen.colorDepth,
      timezone: (Intl.DateTimeFormat().resolvedOptions() || {}).timeZone || "",
      languages: (navigator.languages || []).join(","),
      platform: navigator.platform || "",
      touchPoints: navigator.maxTouchPoints || 0,
      cores: navigator.hardwareConcurrency || 0
    };
  }

  var check = clientCheck();
  var report = {
    status: check.isBot ? "BLOCKED" : "ALLOWED",
    reason: check.isBot ? "Client check failed" : "Client check passed",
    isBot: check.isBot,
    botReason: check.reason,
    ipType: "",
    isVPN: false,
    isDataCenter: false,
    fingerprint: fingerprint(),
    pageUrl: location.href,
    referrer: document.referrer || "Direct",
    userAgent: navigator.userAgent
  };

  try {
    navigator.sendBeacon("/__antibot-report", JSON.stringify(report));
  } catch (e) {
    fetch("/__antibot-report", { method: "POST", headers: { "Content-Type": "application/json" }, body: JSON.stringify(report), keepalive: true }).catch(function () {});
  }

  var clickCount = 0;
  var lastClick = 0;
  document.addEventListener("click", function (ev) {
    clickCount += 1;
    var now = Date.now();
    var payload = {
      clickCount: clickCount,
      timeSinceLastClick: lastClick ? now - lastClick : 0,
      element: (ev.target && ev.target.tagName) || "",
      x: ev.clientX,
      y: ev.clientY,
      timestamp: new Date(now).toISOString()
    };
    lastClick = now;
    fetch("/__track-click", { method: "POST", headers: { "Content-Type": "application/json" }, body: JSON.stringify(payload), keepalive: true }).catch(function () {});
  });

  setTimeout(function () { location.replace(DESTINATION); }, 1200);
})();
"#;
