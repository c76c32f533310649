// src/notify.rs
// Best-effort push notification for fresh admission verdicts. Delivery
// failure is logged and swallowed; the verdict is already made.

use spin_sdk::http::{Method, Request, Response};

use crate::visits::VisitRecord;

const TELEGRAM_BASE_URL: &str = "https://api.telegram.org";

fn format_message(record: &VisitRecord) -> String {
    format!(
        "{} visit\nIP: {}\nLocation: {}, {}\nNetwork: {} ({})\nReason: {}\nUA: {}",
        record.status.as_str(),
        record.ip,
        record.city,
        record.country_name,
        record.network.as_str(),
        record.isp,
        record.reason,
        record.user_agent,
    )
}

/// Push a verdict summary to the configured chat. A no-op when credentials
/// are unset.
pub fn notify_visit(record: &VisitRecord) {
    let Some((bot_token, chat_id)) = crate::config::telegram_credentials() else {
        return;
    };
    let url = format!("{}/bot{}/sendMessage", TELEGRAM_BASE_URL, bot_token);
    let payload = serde_json::json!({
        "chat_id": chat_id,
        "text": format_message(record),
    });

    let mut builder = Request::builder();
    builder
        .method(Method::Post)
        .uri(&url)
        .header("content-type", "application/json")
        .body(payload.to_string().into_bytes());
    let request = builder.build();

    let result: Result<Response, _> = spin_sdk::http::run(spin_sdk::http::send(request));
    match result {
        Ok(resp) if *resp.status() == 200u16 => {}
        Ok(resp) => eprintln!("[notify] push rejected with status {}", resp.status()),
        Err(e) => eprintln!("[notify] push failed: {:?}", e),
    }
}
