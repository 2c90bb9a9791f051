//! Detail-page enrichment for fields that only exist on a per-record page.

use scraper::Html;

use crate::config::DelayWindow;
use crate::error::FetchError;
use crate::fetcher;
use crate::models::{FieldValue, NormalizedRecord};
use crate::monitoring;
use crate::parser::{element_text, fallback_value};
use crate::schema::{CompiledListing, CompiledRule};
use crate::session::Session;

/// Result of enriching one record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrichStats {
    pub fetched: usize,
    pub failed: usize,
}

/// Spaces detail requests: every fetch after the first waits one delay window.
#[derive(Debug)]
pub struct DetailPacer {
    delay: DelayWindow,
    started: bool,
}

impl DetailPacer {
    pub fn new(delay: DelayWindow) -> Self {
        Self {
            delay,
            started: false,
        }
    }

    async fn before_fetch(&mut self) {
        if self.started {
            self.delay.wait().await;
        }
        self.started = true;
    }
}

fn is_http(link: &str) -> bool {
    link.starts_with("http://") || link.starts_with("https://")
}

/// Whole-page text, or the first matching element's text.
fn extract_detail(body: &str, rule: &CompiledRule) -> FieldValue {
    let doc = Html::parse_document(body);
    let text = match &rule.detail_selector {
        Some(sel) => doc.select(sel).next().map(element_text),
        None => Some(element_text(doc.root_element())),
    };
    match text {
        Some(t) if !t.is_empty() => FieldValue::Text(t),
        _ => fallback_value(rule),
    }
}

/// Fill every detail field of `record`. A failing fetch leaves that field at
/// its fallback and never fails the record.
pub async fn enrich_record(
    session: &Session,
    record: &mut NormalizedRecord,
    listing: &CompiledListing,
    pacer: &mut DetailPacer,
) -> EnrichStats {
    let mut stats = EnrichStats::default();
    for rule in listing.detail_rules() {
        let Some(detail) = &rule.rule.detail else {
            continue;
        };
        let link = match record.text(&detail.link_field) {
            Some(l) if is_http(l) => l.to_string(),
            _ => {
                tracing::debug!(field = %rule.name(), "No detail link, keeping fallback");
                continue;
            }
        };
        pacer.before_fetch().await;
        match fetcher::fetch(session, &link, &[], None).await {
            Ok(page) => {
                record.set(rule.name(), extract_detail(&page.body, rule));
                stats.fetched += 1;
            }
            Err(e) => {
                log_failure(session, &link, &e);
                stats.failed += 1;
            }
        }
    }
    stats
}

fn log_failure(session: &Session, link: &str, error: &FetchError) {
    tracing::warn!(
        site = %session.site(),
        url = %link,
        error = %error,
        transient = error.is_transient(),
        "Detail fetch failed, keeping fallback"
    );
    monitoring::record_enrichment_failure(session.site());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, FieldRule, ListingSpec};
    use crate::session::test_session;
    use mockito::Server;
    use std::time::{Duration, Instant};

    fn pacer() -> DetailPacer {
        DetailPacer::new(DelayWindow::new(0, 0))
    }

    fn listing(selector: Option<&str>) -> CompiledListing {
        ListingSpec {
            container: "div".into(),
            exclude: None,
            fields: vec![
                FieldRule::new("link", FieldKind::Link).selector("a").attr("href"),
                FieldRule::new("description", FieldKind::Text)
                    .detail("link", selector)
                    .fallback("Description unavailable."),
            ],
            spans: vec![],
        }
        .compile()
        .unwrap()
    }

    fn record(link: &str) -> NormalizedRecord {
        let mut r = NormalizedRecord::new();
        r.set("link", FieldValue::Text(link.into()));
        r.set(
            "description",
            FieldValue::Text("Description unavailable.".into()),
        );
        r
    }

    #[tokio::test]
    async fn fills_selector_text() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/ad/1")
            .with_status(200)
            .with_body(
                r#"<div id="freetext_description"><p class="freitext">Hallo,
                   ich suche ein Zimmer.</p></div>"#,
            )
            .create_async()
            .await;
        let session = test_session(&server.url());
        let mut r = record(&format!("{}/ad/1", server.url()));
        let stats = enrich_record(
            &session,
            &mut r,
            &listing(Some("#freetext_description p.freitext")),
            &mut pacer(),
        )
        .await;
        assert_eq!(stats, EnrichStats { fetched: 1, failed: 0 });
        assert_eq!(r.text("description"), Some("Hallo, ich suche ein Zimmer."));
    }

    #[tokio::test]
    async fn whole_page_text_mode() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/msg/7")
            .with_status(200)
            .with_body("<html><body><h1>Project</h1><p>Terraform role</p></body></html>")
            .create_async()
            .await;
        let session = test_session(&server.url());
        let mut r = record(&format!("{}/msg/7", server.url()));
        enrich_record(&session, &mut r, &listing(None), &mut pacer()).await;
        assert_eq!(r.text("description"), Some("Project Terraform role"));
    }

    #[tokio::test]
    async fn failure_keeps_fallback() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/ad/2")
            .with_status(500)
            .create_async()
            .await;
        let session = test_session(&server.url());
        let mut r = record(&format!("{}/ad/2", server.url()));
        let stats = enrich_record(&session, &mut r, &listing(Some("#x")), &mut pacer()).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(r.text("description"), Some("Description unavailable."));
    }

    #[tokio::test]
    async fn missing_element_keeps_fallback() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/ad/3")
            .with_status(200)
            .with_body("<p>captcha</p>")
            .create_async()
            .await;
        let session = test_session(&server.url());
        let mut r = record(&format!("{}/ad/3", server.url()));
        let stats = enrich_record(&session, &mut r, &listing(Some("#x")), &mut pacer()).await;
        assert_eq!(stats.fetched, 1);
        assert_eq!(r.text("description"), Some("Description unavailable."));
    }

    #[tokio::test]
    async fn non_http_link_is_skipped() {
        let session = test_session("http://127.0.0.1:1");
        let mut r = record("unavailable");
        let stats = enrich_record(&session, &mut r, &listing(None), &mut pacer()).await;
        assert_eq!(stats, EnrichStats::default());
    }

    #[tokio::test]
    async fn delay_applies_between_detail_fields_of_one_record() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/ad/4")
            .with_status(200)
            .with_body("<p id=\"a\">A</p><p id=\"b\">B</p>")
            .create_async()
            .await;
        let listing = ListingSpec {
            container: "div".into(),
            exclude: None,
            fields: vec![
                FieldRule::new("link", FieldKind::Link).selector("a").attr("href"),
                FieldRule::new("first", FieldKind::Text).detail("link", Some("#a")),
                FieldRule::new("second", FieldKind::Text).detail("link", Some("#b")),
            ],
            spans: vec![],
        }
        .compile()
        .unwrap();
        let session = test_session(&server.url());
        let mut r = NormalizedRecord::new();
        r.set("link", FieldValue::Text(format!("{}/ad/4", server.url())));
        let mut pacer = DetailPacer::new(DelayWindow::new(150, 150));

        let started = Instant::now();
        let stats = enrich_record(&session, &mut r, &listing, &mut pacer).await;
        assert_eq!(stats.fetched, 2);
        assert_eq!(r.text("second"), Some("B"));
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
