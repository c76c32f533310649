// src/classify.rs
// Reputation classifier: user-agent bot scoring plus network-origin
// classification from organization/hostname/ASN metadata. Pure functions,
// shared by the server-side admission path and the client-report path.

use serde::{Deserialize, Serialize};

/// Weight of a definitive user-agent signature (crawler names, HTTP client
/// libraries). One hit alone crosses the default threshold.
const STRONG_SIGNAL_WEIGHT: u32 = 100;
/// Weight of an automation hint (headless/driver markers). Two weak hints
/// are needed to cross the default threshold of 80.
const WEAK_SIGNAL_WEIGHT: u32 = 50;

/// Crawler and scraper markers matched as substrings of the lowercased UA.
const CRAWLER_MARKERS: &[&str] = &["bot", "crawl", "spider", "slurp", "mediapartners"];

/// Automation tooling hints. Weaker than a crawler name: real browsers under
/// remote control often leak exactly one of these.
const AUTOMATION_MARKERS: &[&str] = &["headless", "phantom", "selenium", "webdriver", "scraper"];

/// HTTP client libraries that never belong to a human browsing session.
const HTTP_CLIENT_MARKERS: &[&str] = &[
    "python-requests",
    "python-urllib",
    "go-http-client",
    "okhttp",
    "httpclient",
    "node-fetch",
    "axios/",
];

/// Tools matched only as standalone "<name>/<version>" user agents, so a
/// browser UA that merely mentions the word is not penalized.
const STANDALONE_TOOLS: &[&str] = &["curl", "wget", "java", "ruby"];

/// Organization keywords that mark a consumer ISP. A match here exempts the
/// IP from the cloud/datacenter checks below (but not the VPN check).
const LEGIT_ISP_KEYWORDS: &[&str] = &[
    "telecom",
    "telecommunications",
    "telephone",
    "mobile",
    "cellular",
    "wireless",
    "broadband",
    "internet service",
    "cable",
    "fiber",
    "fibre",
    "isp",
    "internet provider",
    "communications",
    "networks limited",
    "networks ltd",
    "airtel",
    "mtn",
    "vodafone",
    "orange",
    "telstra",
    "verizon",
    "t-mobile",
    "comcast",
    "spectrum",
    "centurylink",
    "frontier",
];

const CLOUD_PROVIDERS: &[&str] = &[
    "digitalocean",
    "digital ocean",
    "amazon web services",
    "aws",
    "amazon data services",
    "amazon.com",
    "google cloud",
    "google llc",
    "microsoft corporation",
    "microsoft azure",
    "azure",
    "linode",
    "akamai technologies",
    "vultr",
    "choopa",
    "ovh",
    "scaleway",
    "hetzner",
    "rackspace",
    "cloudflare",
    "fastly",
    "contabo",
    "oracle cloud",
    "ibm cloud",
    "alibaba cloud",
    "tencent cloud",
];

const DATACENTER_KEYWORDS: &[&str] = &[
    "data center",
    "datacenter",
    "data centre",
    "datacentre",
    "colocation",
    "colo facility",
    "server farm",
    "dedicated server",
    "vps hosting",
    "virtual private server",
];

const VPN_KEYWORDS: &[&str] = &[
    "vpn",
    "virtual private network",
    "proxy server",
    "proxy service",
    "nordvpn",
    "expressvpn",
    "surfshark",
    "protonvpn",
    "cyberghost",
    "privatevpn",
    "purevpn",
    "ipvanish",
    "tunnelbear",
    "hidemyass",
    "hide my ass",
    "private internet access",
    "windscribe",
    "hotspot shield",
    "mullvad",
    "torguard",
    "anonymizer",
    "smartproxy",
    "bright data",
    "luminati",
    "oxylabs",
];

/// ASNs of known hosting/VPN operators, matched against the number parsed
/// from the org string.
const SUSPICIOUS_ASNS: &[&str] = &[
    "16509", "14618", // Amazon
    "15169", "396982", // Google
    "8075", // Microsoft
    "13335", // Cloudflare
    "20940", // Akamai
    "14061", "62567", // DigitalOcean
    "63949", // Linode
    "20473", // Vultr
    "16276", "35540", // OVH
    "24940", // Hetzner
    "12876", // Scaleway
    "51167", // Contabo
    "31898", // Oracle Cloud
    "36351", // IBM Cloud
    "45102", // Alibaba Cloud
    "132203", // Tencent Cloud
    "26347", // DreamHost
    "46606", // Bluehost
    "26496", // GoDaddy
    "27357", // Rackspace
    "36352", // ColoCrossing
    "46844", // Sharktech
    "8100", // Quadranet
    "9009", // M247
    "60068", // DataCamp
    "202425", // NordVPN
];

/// Where a visitor's traffic originates, most suspicious first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    #[serde(rename = "VPN/Proxy")]
    VpnProxy,
    #[serde(rename = "Cloud Provider")]
    CloudProvider,
    #[serde(rename = "Data Center")]
    DataCenter,
    #[serde(rename = "Suspicious Network")]
    SuspiciousAsn,
    #[serde(rename = "Residential/ISP")]
    Residential,
    #[serde(rename = "Unknown")]
    Unknown,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::VpnProxy => "VPN/Proxy",
            NetworkType::CloudProvider => "Cloud Provider",
            NetworkType::DataCenter => "Data Center",
            NetworkType::SuspiciousAsn => "Suspicious Network",
            NetworkType::Residential => "Residential/ISP",
            NetworkType::Unknown => "Unknown",
        }
    }

    pub fn is_vpn(&self) -> bool {
        matches!(self, NetworkType::VpnProxy)
    }

    pub fn is_data_center(&self) -> bool {
        matches!(self, NetworkType::CloudProvider | NetworkType::DataCenter)
    }

    /// Anything that is not a consumer connection (or unknown) counts as
    /// non-residential for the admission decision.
    pub fn is_non_residential(&self) -> bool {
        !matches!(self, NetworkType::Residential | NetworkType::Unknown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub is_bot: bool,
    pub network: NetworkType,
    pub score: u32,
    pub reasons: Vec<String>,
}

/// Returns true when the UA is a bare "<tool>/<version>" agent for one of
/// the standalone tools ("curl/8.4.0" yes, "...like curl/1.0 extra" no).
fn is_standalone_tool(ua: &str) -> Option<&'static str> {
    for tool in STANDALONE_TOOLS {
        if let Some(rest) = ua.strip_prefix(&format!("{}/", tool)) {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit() || c == '.') {
                return Some(tool);
            }
        }
    }
    None
}

/// Score a user agent against the automation signatures. Each distinct match
/// contributes its weight; the caller compares the total to a threshold.
pub fn score_user_agent(user_agent: &str) -> (u32, Vec<String>) {
    let ua = user_agent.to_lowercase();
    let mut score = 0u32;
    let mut reasons = Vec::new();

    for marker in CRAWLER_MARKERS {
        if ua.contains(marker) {
            score += STRONG_SIGNAL_WEIGHT;
            reasons.push(format!("crawler marker \"{}\"", marker));
        }
    }
    for marker in AUTOMATION_MARKERS {
        if ua.contains(marker) {
            score += WEAK_SIGNAL_WEIGHT;
            reasons.push(format!("automation marker \"{}\"", marker));
        }
    }
    for marker in HTTP_CLIENT_MARKERS {
        if ua.contains(marker) {
            score += STRONG_SIGNAL_WEIGHT;
            reasons.push(format!("http client \"{}\"", marker.trim_end_matches('/')));
        }
    }
    if let Some(tool) = is_standalone_tool(&ua) {
        score += STRONG_SIGNAL_WEIGHT;
        reasons.push(format!("standalone tool \"{}\"", tool));
    }

    (score, reasons)
}

fn any_keyword(haystacks: &[&str], keywords: &[&'static str]) -> Option<&'static str> {
    keywords
        .iter()
        .find(|k| haystacks.iter().any(|h| h.contains(*k)))
        .copied()
}

/// Classify the network origin from org/hostname/ASN metadata.
///
/// Order matters: a legitimate-ISP keyword match exempts the IP from the
/// cloud and datacenter checks so that a carrier whose name contains an
/// ambiguous substring is not misclassified. The exemption reads the org
/// field only, never the reverse hostname. The VPN check is not exempted:
/// a residential ISP account resold as a VPN endpoint is still a VPN.
/// Missing fields degrade to Residential (fail-open).
pub fn classify_network(org: &str, asn: Option<&str>, hostname: &str) -> NetworkType {
    let org = org.to_lowercase();
    let hostname = hostname.to_lowercase();
    let fields = [org.as_str(), hostname.as_str()];

    let is_legit_isp = any_keyword(&[org.as_str()], LEGIT_ISP_KEYWORDS).is_some();
    let is_vpn = any_keyword(&fields, VPN_KEYWORDS).is_some();
    let is_cloud = !is_legit_isp && any_keyword(&fields, CLOUD_PROVIDERS).is_some();
    let is_datacenter = !is_legit_isp && any_keyword(&fields, DATACENTER_KEYWORDS).is_some();
    let is_suspicious_asn = asn
        .map(|a| SUSPICIOUS_ASNS.contains(&a))
        .unwrap_or(false);

    if is_vpn {
        NetworkType::VpnProxy
    } else if is_cloud {
        NetworkType::CloudProvider
    } else if is_datacenter {
        NetworkType::DataCenter
    } else if is_suspicious_asn {
        NetworkType::SuspiciousAsn
    } else {
        NetworkType::Residential
    }
}

/// Full classification for one visitor. `threshold` is the configured bot
/// score cutoff (`Config::bot_score_threshold`).
pub fn classify(
    user_agent: &str,
    org: &str,
    asn: Option<&str>,
    hostname: &str,
    threshold: u32,
) -> Classification {
    let (score, reasons) = score_user_agent(user_agent);
    let network = classify_network(org, asn, hostname);
    Classification {
        is_bot: score >= threshold,
        network,
        score,
        reasons,
    }
}
