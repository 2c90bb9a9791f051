//! Invoice/receipt attachment selection for mail messages.
//!
//! A message is flattened into `(path, content)` pairs once; classification
//! reads filenames and the keyword gate reads the joined text parts.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::{Deserialize, Serialize};

use crate::error::FilterError;
use crate::filter::{KeywordMatcher, MatchMode};

const INVOICE_KEYWORDS: &[&str] = &["invoice", "inv", "bill", "rechnung", "faktura"];
const RECEIPT_KEYWORDS: &[&str] = &["receipt", "quittung", "beleg"];

/// Part bodies are base64url with or without padding.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GmailBody {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, rename = "attachmentId")]
    pub attachment_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GmailPart {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, rename = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub body: GmailBody,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub parts: Vec<GmailPart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub payload: GmailPart,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailAddress {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphFrom {
    #[serde(default, rename = "emailAddress")]
    pub email_address: EmailAddress,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphBody {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphAttachment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "contentType")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub from: GraphFrom,
    #[serde(default)]
    pub body: GraphBody,
    #[serde(default)]
    pub attachments: Vec<GraphAttachment>,
}

/// Either supported mail shape. Gmail payloads are recognized by `payload`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MailMessage {
    Gmail(GmailMessage),
    Graph(GraphMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartContent {
    Text(String),
    Attachment {
        id: String,
        filename: String,
        content_type: Option<String>,
    },
}

impl PartContent {
    fn is_pdf(&self) -> bool {
        match self {
            PartContent::Attachment {
                filename,
                content_type,
                ..
            } => {
                filename.to_lowercase().ends_with(".pdf")
                    || content_type.as_deref() == Some("application/pdf")
            }
            PartContent::Text(_) => false,
        }
    }
}

fn decode_body(data: &str) -> String {
    match URL_SAFE_LENIENT.decode(data.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable message part, ignoring");
            String::new()
        }
    }
}

fn flatten_gmail_part(part: &GmailPart, path: String, out: &mut Vec<(String, PartContent)>) {
    for (i, child) in part.parts.iter().enumerate() {
        flatten_gmail_part(child, format!("{path}.parts[{i}]"), out);
    }
    if let Some(data) = part.body.data.as_deref().filter(|d| !d.is_empty()) {
        out.push((format!("{path}.body"), PartContent::Text(decode_body(data))));
    }
    if let Some(filename) = &part.filename
        && !filename.is_empty()
    {
        out.push((
            path,
            PartContent::Attachment {
                id: part.body.attachment_id.clone().unwrap_or_default(),
                filename: filename.clone(),
                content_type: part.mime_type.clone(),
            },
        ));
    }
}

impl MailMessage {
    pub fn id(&self) -> &str {
        let id = match self {
            MailMessage::Gmail(m) => m.id.as_deref(),
            MailMessage::Graph(m) => m.id.as_deref(),
        };
        id.unwrap_or("unknown")
    }

    /// Depth-first `(path, content)` pairs. Root body and headers come first.
    pub fn flatten(&self) -> Vec<(String, PartContent)> {
        let mut out = Vec::new();
        match self {
            MailMessage::Gmail(m) => {
                let root = &m.payload;
                if let Some(data) = root.body.data.as_deref().filter(|d| !d.is_empty()) {
                    out.push(("payload.body".into(), PartContent::Text(decode_body(data))));
                }
                let headers = root
                    .headers
                    .iter()
                    .map(|h| h.value.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                out.push(("payload.headers".into(), PartContent::Text(headers)));
                for (i, part) in root.parts.iter().enumerate() {
                    flatten_gmail_part(part, format!("payload.parts[{i}]"), &mut out);
                }
            }
            MailMessage::Graph(m) => {
                out.push(("body".into(), PartContent::Text(m.body.content.clone())));
                out.push(("subject".into(), PartContent::Text(m.subject.clone())));
                out.push((
                    "from".into(),
                    PartContent::Text(m.from.email_address.address.clone()),
                ));
                for (i, a) in m.attachments.iter().enumerate() {
                    out.push((
                        format!("attachments[{i}]"),
                        PartContent::Attachment {
                            id: a.id.clone(),
                            filename: a.name.clone(),
                            content_type: a.content_type.clone(),
                        },
                    ));
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentClass {
    Invoice,
    Receipt,
    Unknown,
}

/// Lowercase substring match on the filename; invoice wins over receipt.
pub fn classify_filename(filename: &str) -> AttachmentClass {
    let lower = filename.to_lowercase();
    if INVOICE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        AttachmentClass::Invoice
    } else if RECEIPT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        AttachmentClass::Receipt
    } else {
        AttachmentClass::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRef {
    pub message_id: String,
    pub attachment_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AttachmentReport {
    pub filtered_attachments: Vec<AttachmentRef>,
}

/// Content gate: every classification keyword plus the caller's, word-bounded.
pub fn content_matcher(additional_keywords: &[String]) -> Result<KeywordMatcher, FilterError> {
    let keywords: Vec<String> = INVOICE_KEYWORDS
        .iter()
        .chain(RECEIPT_KEYWORDS)
        .map(|k| k.to_string())
        .chain(additional_keywords.iter().cloned())
        .collect();
    KeywordMatcher::new(&keywords, MatchMode::WordBoundary)
}

fn select_for_message(message: &MailMessage, gate: &KeywordMatcher) -> Vec<String> {
    let parts = message.flatten();
    let mut candidates: Vec<(String, AttachmentClass)> = Vec::new();
    let mut text = Vec::new();
    for (path, content) in &parts {
        match content {
            PartContent::Text(t) => text.push(t.as_str()),
            PartContent::Attachment { id, filename, .. } if content.is_pdf() => {
                if id.is_empty() {
                    tracing::debug!(%path, "PDF part without attachment id");
                }
                candidates.push((id.clone(), classify_filename(filename)));
            }
            PartContent::Attachment { .. } => {}
        }
    }

    let of = |class: AttachmentClass| -> Vec<String> {
        candidates
            .iter()
            .filter(|(_, c)| *c == class)
            .map(|(id, _)| id.clone())
            .collect()
    };
    let invoices = of(AttachmentClass::Invoice);
    if !invoices.is_empty() {
        return invoices;
    }
    let receipts = of(AttachmentClass::Receipt);
    if !receipts.is_empty() {
        return receipts;
    }
    let unknowns = of(AttachmentClass::Unknown);
    if unknowns.is_empty() || !gate.matches_any(&text.join(" ")) {
        return Vec::new();
    }
    unknowns
}

/// Select invoice, else receipt, else content-gated unknown PDFs per message.
pub fn filter_attachments(
    messages: &[MailMessage],
    additional_keywords: &[String],
) -> Result<AttachmentReport, FilterError> {
    let gate = content_matcher(additional_keywords)?;
    let mut report = AttachmentReport::default();
    for message in messages {
        let ids = select_for_message(message, &gate);
        tracing::debug!(message = %message.id(), selected = ids.len(), "Classified attachments");
        report
            .filtered_attachments
            .extend(ids.into_iter().map(|attachment_id| AttachmentRef {
                message_id: message.id().to_string(),
                attachment_id,
            }));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn b64(s: &str) -> String {
        URL_SAFE.encode(s)
    }

    fn gmail(id: &str, body: &str, subject: &str, files: &[(&str, &str)]) -> MailMessage {
        let parts: Vec<_> = files
            .iter()
            .map(|(name, att)| json!({"filename": name, "body": {"attachmentId": att}}))
            .collect();
        serde_json::from_value(json!({
            "id": id,
            "payload": {
                "body": {"data": b64(body)},
                "headers": [{"name": "Subject", "value": subject}],
                "parts": parts
            }
        }))
        .unwrap()
    }

    fn ids(report: &AttachmentReport) -> Vec<&str> {
        report
            .filtered_attachments
            .iter()
            .map(|a| a.attachment_id.as_str())
            .collect()
    }

    #[test]
    fn invoice_beats_receipt() {
        let msg = gmail(
            "m1",
            "hello",
            "docs",
            &[("receipt.pdf", "R1"), ("invoice.pdf", "I1"), ("doc.pdf", "U1")],
        );
        let report = filter_attachments(&[msg], &[]).unwrap();
        assert_eq!(ids(&report), vec!["I1"]);
    }

    #[test]
    fn unknown_pdf_is_gated_by_content() {
        let quiet = gmail("m1", "Anbei das Dokument", "Hallo", &[("scan.pdf", "U1")]);
        assert!(filter_attachments(&[quiet], &[]).unwrap().filtered_attachments.is_empty());

        let keyword = gmail("m2", "Anbei die Rechnung", "Hallo", &[("scan.pdf", "U1")]);
        assert_eq!(ids(&filter_attachments(&[keyword], &[]).unwrap()), vec!["U1"]);
    }

    #[test]
    fn additional_keywords_extend_gate() {
        let msg = gmail("m1", "Your statement", "Hi", &[("scan.pdf", "U1")]);
        let report = filter_attachments(&[msg], &["statement".to_string()]).unwrap();
        assert_eq!(ids(&report), vec!["U1"]);
    }

    #[test]
    fn two_message_scenario() {
        let first = gmail(
            "m1",
            "Thanks for your order",
            "Your Invoice from Example Company",
            &[("invoice_2024.pdf", "ATT1")],
        );
        let second = gmail("m2", "See you soon", "Lunch", &[("photo.pdf", "ATT2")]);
        let report = filter_attachments(&[first, second], &[]).unwrap();
        assert_eq!(
            report.filtered_attachments,
            vec![AttachmentRef {
                message_id: "m1".into(),
                attachment_id: "ATT1".into()
            }]
        );
    }

    #[test]
    fn non_pdf_attachments_are_ignored() {
        let msg = gmail("m1", "invoice attached", "Invoice", &[("invoice.png", "P1")]);
        assert!(filter_attachments(&[msg], &[]).unwrap().filtered_attachments.is_empty());
    }

    #[test]
    fn nested_parts_are_flattened() {
        let msg: MailMessage = serde_json::from_value(json!({
            "id": "m1",
            "payload": {
                "headers": [],
                "parts": [{
                    "mimeType": "multipart/alternative",
                    "parts": [
                        {"mimeType": "text/plain", "body": {"data": b64("Ihre Quittung")}},
                        {"filename": "scan.PDF", "body": {"attachmentId": "U9"}}
                    ]
                }]
            }
        }))
        .unwrap();
        let flat = msg.flatten();
        assert!(flat.iter().any(|(p, c)| p == "payload.parts[0].parts[0].body"
            && *c == PartContent::Text("Ihre Quittung".into())));
        assert_eq!(ids(&filter_attachments(&[msg], &[]).unwrap()), vec!["U9"]);
    }

    #[test]
    fn graph_messages_are_supported() {
        let msg: MailMessage = serde_json::from_value(json!({
            "id": "g1",
            "subject": "Monatsabrechnung",
            "from": {"emailAddress": {"address": "billing@example.com"}},
            "body": {"content": "<p>Ihre Rechnung liegt bei</p>"},
            "attachments": [
                {"id": "A1", "name": "document", "contentType": "application/pdf"},
                {"id": "A2", "name": "logo.png", "contentType": "image/png"}
            ]
        }))
        .unwrap();
        assert!(matches!(msg, MailMessage::Graph(_)));
        assert_eq!(ids(&filter_attachments(&[msg], &[]).unwrap()), vec!["A1"]);
    }

    #[test]
    fn missing_id_defaults_to_unknown() {
        let msg: MailMessage = serde_json::from_value(json!({
            "payload": {"parts": [{"filename": "bill.pdf", "body": {"attachmentId": "B1"}}]}
        }))
        .unwrap();
        let report = filter_attachments(&[msg], &[]).unwrap();
        assert_eq!(report.filtered_attachments[0].message_id, "unknown");
    }

    #[test]
    fn pdf_without_attachment_id_is_reported_empty() {
        let msg: MailMessage = serde_json::from_value(json!({
            "id": "m1",
            "payload": {"parts": [{"filename": "invoice.pdf", "body": {"size": 0}}]}
        }))
        .unwrap();
        let report = filter_attachments(&[msg], &[]).unwrap();
        assert_eq!(
            report.filtered_attachments,
            vec![AttachmentRef {
                message_id: "m1".into(),
                attachment_id: String::new()
            }]
        );
    }

    #[test]
    fn classification_keywords() {
        assert_eq!(classify_filename("Rechnung_03.pdf"), AttachmentClass::Invoice);
        assert_eq!(classify_filename("Beleg.pdf"), AttachmentClass::Receipt);
        assert_eq!(classify_filename("scan.pdf"), AttachmentClass::Unknown);
    }

    #[test]
    fn unpadded_base64_decodes() {
        assert_eq!(decode_body("aGk"), "hi");
        assert_eq!(decode_body("!!!"), "");
    }
}
