//! Outbound application messages.
//!
//! For each item the listing URL is rewritten to its message page, the CSRF
//! token and recipient context are read from that page, and a JSON
//! conversation payload is posted. Items are spaced by a randomized delay.

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::config::{DelayWindow, TokenPolicy};
use crate::error::SendError;
use crate::fetcher;
use crate::monitoring;
use crate::session::{Session, fetch_token_with_page};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutboundSpec {
    /// Substring of the listing URL replaced to reach the message page.
    pub message_url_from: String,
    pub message_url_to: String,
    pub submit_url: String,
    pub csrf_field: String,
    /// Hidden inputs copied from the message page into the payload.
    pub context_fields: Vec<String>,
    /// Markers in a 400 body that mean "skip this item".
    pub soft_skip_markers: Vec<String>,
    pub delay: DelayWindow,
}

impl Default for OutboundSpec {
    fn default() -> Self {
        Self {
            message_url_from: "wohnungen-in-".into(),
            message_url_to: "nachricht-senden/wohnungen-in-".into(),
            submit_url: "/ajax/conversations.php?action=conversations".into(),
            csrf_field: "csrf_token".into(),
            context_fields: vec!["user_id".into(), "ad_id".into(), "ad_type".into()],
            soft_skip_markers: vec![
                "conversation already exists".into(),
                "duplicate".into(),
                "restricted".into(),
            ],
            delay: DelayWindow::new(2000, 5000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationItem {
    pub listing_url: String,
    #[serde(default)]
    pub recipient_name: String,
    #[serde(alias = "application")]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedItem {
    pub listing_url: String,
    pub status: u16,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SendReport {
    pub sent: Vec<String>,
    pub skipped: Vec<SkippedItem>,
}

pub fn message_url(spec: &OutboundSpec, listing_url: &str) -> String {
    listing_url.replace(&spec.message_url_from, &spec.message_url_to)
}

/// Values of the named hidden inputs; absent inputs become `null`.
pub fn context_from_page(body: &str, fields: &[String]) -> Map<String, Value> {
    let doc = Html::parse_document(body);
    let mut context = Map::new();
    for field in fields {
        let value = Selector::parse(&format!("input[name=\"{field}\"]"))
            .ok()
            .and_then(|sel| {
                doc.select(&sel)
                    .find_map(|el| el.value().attr("value"))
                    .map(str::to_string)
            });
        if value.is_none() {
            tracing::warn!(field = %field, "Context field missing on message page");
        }
        context.insert(field.clone(), value.map_or(Value::Null, Value::String));
    }
    context
}

pub fn build_payload(
    spec: &OutboundSpec,
    mut context: Map<String, Value>,
    csrf: &str,
    message: &str,
) -> Value {
    context.insert(spec.csrf_field.clone(), Value::String(csrf.to_string()));
    context.insert(
        "messages".into(),
        json!([{ "content": message, "message_type": "text" }]),
    );
    Value::Object(context)
}

fn soft_skip_reason(spec: &OutboundSpec, status: StatusCode, body: &str) -> Option<String> {
    if status != StatusCode::BAD_REQUEST {
        return None;
    }
    let lower = body.to_lowercase();
    spec.soft_skip_markers
        .iter()
        .find(|m| lower.contains(&m.to_lowercase()))
        .cloned()
}

/// Send every item in order. A soft-skip continues; any other non-200 aborts.
pub async fn send_applications(
    session: &Session,
    spec: &OutboundSpec,
    items: &[ApplicationItem],
    token: &TokenPolicy,
) -> Result<SendReport, SendError> {
    let policy = TokenPolicy {
        field_name: spec.csrf_field.clone(),
        ..token.clone()
    };
    let mut extra = HeaderMap::new();
    extra.insert(
        HeaderName::from_static("x-requested-with"),
        HeaderValue::from_static("XMLHttpRequest"),
    );

    let mut report = SendReport::default();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            spec.delay.wait().await;
        }
        let url = message_url(spec, &item.listing_url);
        let (csrf, page) = fetch_token_with_page(session, &url, &policy).await?;
        let context = context_from_page(&page.body, &spec.context_fields);
        let payload = build_payload(spec, context, &csrf, &item.message);

        let (status, body) =
            fetcher::post_json(session, &spec.submit_url, &payload, Some(extra.clone())).await?;
        if status == StatusCode::OK {
            tracing::info!(site = %session.site(), recipient = %item.recipient_name, url = %url, "Message sent");
            monitoring::record_message(session.site(), "sent");
            report.sent.push(item.listing_url.clone());
        } else if let Some(reason) = soft_skip_reason(spec, status, &body) {
            tracing::warn!(site = %session.site(), url = %url, %status, %reason, "Message skipped");
            monitoring::record_message(session.site(), "skipped");
            report.skipped.push(SkippedItem {
                listing_url: item.listing_url.clone(),
                status: status.as_u16(),
                reason,
            });
        } else {
            tracing::error!(site = %session.site(), url = %url, %status, "Message rejected, aborting batch");
            monitoring::record_message(session.site(), "failed");
            return Err(SendError::Rejected {
                status,
                url: spec.submit_url.clone(),
                body,
            });
        }
    }
    Ok(report)
}
