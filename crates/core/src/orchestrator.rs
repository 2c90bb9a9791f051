//! One end-to-end run: authenticate, fetch, parse, enrich, filter.
//!
//! Runs are independent; a failure in one site never touches another. The
//! public entry point converts every error into a [`RunOutcome::Failure`]
//! naming the stage that was active.

use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::config::SiteConfig;
use crate::enrich::{DetailPacer, EnrichStats, enrich_record};
use crate::error::{ConfigError, ScoutError, SendError};
use crate::fetcher::{self, PageContent};
use crate::filter::{self, CompiledFilter};
use crate::models::{Credentials, NormalizedRecord, RunOutcome, RunRequest};
use crate::monitoring;
use crate::outbound::{self, ApplicationItem, SendReport};
use crate::parser::{ParseContext, parse_page};
use crate::query::build_page_requests;
use crate::schema::CompiledListing;
use crate::session::{Session, authenticate, fetch_token};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Authenticated,
    Fetching,
    Parsing,
    Enriching,
    Filtering,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Init => "init",
            RunState::Authenticated => "authenticated",
            RunState::Fetching => "fetching",
            RunState::Parsing => "parsing",
            RunState::Enriching => "enriching",
            RunState::Filtering => "filtering",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Drives runs against one configured site.
#[derive(Debug)]
pub struct Orchestrator {
    site: SiteConfig,
    listing: CompiledListing,
}

impl Orchestrator {
    pub fn new(site: SiteConfig) -> Result<Self, ConfigError> {
        let listing = site.listing.compile().map_err(|e| ConfigError::Invalid {
            site: site.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { site, listing })
    }

    pub fn site(&self) -> &SiteConfig {
        &self.site
    }

    /// Execute one run. Never returns an error; failures are reported in
    /// the outcome together with the stage they happened in.
    pub async fn run(&self, credentials: &Credentials, request: &RunRequest) -> RunOutcome {
        let mut state = RunState::Init;
        tracing::info!(site = %self.site.name, "Run started");
        let timer = monitoring::Timer::start("portal_scout_run_duration_seconds", &self.site.name);
        let result = self.execute(credentials, request, &mut state).await;
        let elapsed_ms = timer.finish().as_millis() as u64;
        match result {
            Ok(records) => {
                tracing::info!(site = %self.site.name, records = records.len(), elapsed_ms, "Run finished");
                monitoring::record_run(&self.site.name, "success");
                RunOutcome::Success {
                    result_records: records,
                }
            }
            Err(e) => {
                let stage = state;
                tracing::error!(site = %self.site.name, %stage, error = %e, elapsed_ms, "Run failed");
                self.advance(&mut state, RunState::Failed);
                monitoring::record_run(&self.site.name, "failure");
                RunOutcome::Failure {
                    error: e.to_string(),
                    stage,
                }
            }
        }
    }

    fn advance(&self, state: &mut RunState, next: RunState) {
        tracing::debug!(site = %self.site.name, from = %state, to = %next, "State transition");
        *state = next;
    }

    async fn execute(
        &self,
        credentials: &Credentials,
        request: &RunRequest,
        state: &mut RunState,
    ) -> Result<Vec<NormalizedRecord>, ScoutError> {
        let now = chrono::Local::now().naive_local();
        // Malformed criteria must fail before any request is sent.
        let filter = filter::compile(&request.criteria, &self.site.listing, now)?;

        let session = authenticate(&self.site, credentials).await?;
        self.advance(state, RunState::Authenticated);

        let csrf = self.search_token(&session).await?;
        self.advance(state, RunState::Fetching);
        let pages = self.fetch_pages(&session, request, csrf.as_deref()).await?;

        self.advance(state, RunState::Parsing);
        let records = self.parse_pages(&session, &pages, now);
        tracing::info!(site = %self.site.name, pages = pages.len(), records = records.len(), "Parsed search results");

        let records = if self.site.listing.has_detail_fields() {
            self.advance(state, RunState::Enriching);
            self.enrich(&session, records).await
        } else {
            records
        };

        self.advance(state, RunState::Filtering);
        let mut kept = apply_filter(records, &filter);
        if let Some(limit) = request.limit {
            kept.truncate(limit);
        }
        self.advance(state, RunState::Done);
        Ok(kept)
    }

    /// CSRF value for the search query, if the site expects one.
    async fn search_token(&self, session: &Session) -> Result<Option<String>, ScoutError> {
        if self.site.search.csrf_param.is_none() {
            return Ok(None);
        }
        if let Some(token) = &session.tokens().csrf {
            return Ok(Some(token.clone()));
        }
        let token = fetch_token(session, session.base_url().as_str(), &self.site.token).await?;
        Ok(Some(token))
    }

    async fn fetch_pages(
        &self,
        session: &Session,
        request: &RunRequest,
        csrf: Option<&str>,
    ) -> Result<Vec<PageContent>, ScoutError> {
        let mut pages = Vec::new();
        for req in build_page_requests(&self.site.search, &request.params, csrf) {
            tracing::info!(site = %self.site.name, page = req.page, url = %req.display_url(), "Fetching search page");
            let mut page = fetcher::fetch(session, &req.url, &req.params, None).await?;
            if self.site.search.refetch_on_redirect
                && let Some(target) = page.redirected().map(str::to_string)
            {
                tracing::debug!(site = %self.site.name, %target, "Search redirected, fetching target");
                page = fetcher::fetch(session, &target, &[], None).await?;
            }
            pages.push(page);
        }
        Ok(pages)
    }

    fn parse_pages(
        &self,
        session: &Session,
        pages: &[PageContent],
        now: NaiveDateTime,
    ) -> Vec<NormalizedRecord> {
        let ctx = ParseContext {
            base_url: session.base_url().clone(),
            now,
        };
        pages
            .iter()
            .flat_map(|page| parse_page(&page.body, &self.listing, &ctx))
            .collect()
    }

    /// Sequential detail fetches with a polite delay before each request after
    /// the first.
    async fn enrich(
        &self,
        session: &Session,
        mut records: Vec<NormalizedRecord>,
    ) -> Vec<NormalizedRecord> {
        let mut pacer = DetailPacer::new(self.site.detail_delay());
        let mut totals = EnrichStats::default();
        for record in records.iter_mut() {
            let stats = enrich_record(session, record, &self.listing, &mut pacer).await;
            totals.fetched += stats.fetched;
            totals.failed += stats.failed;
        }
        tracing::info!(
            site = %self.site.name,
            fetched = totals.fetched,
            failed = totals.failed,
            "Enrichment finished"
        );
        records
    }

    /// Log in and send application messages through the site's outbound
    /// configuration.
    pub async fn send_applications(
        &self,
        credentials: &Credentials,
        items: &[ApplicationItem],
    ) -> Result<SendReport, ScoutError> {
        let spec = self
            .site
            .outbound
            .as_ref()
            .ok_or_else(|| SendError::NotConfigured(self.site.name.clone()))?;
        let session = authenticate(&self.site, credentials).await?;
        let report = outbound::send_applications(&session, spec, items, &self.site.token).await?;
        tracing::info!(
            site = %self.site.name,
            sent = report.sent.len(),
            skipped = report.skipped.len(),
            "Applications processed"
        );
        Ok(report)
    }
}

fn apply_filter(records: Vec<NormalizedRecord>, filter: &CompiledFilter) -> Vec<NormalizedRecord> {
    let total = records.len();
    let kept: Vec<_> = records
        .into_iter()
        .filter(|r| filter::matches(r, filter))
        .collect();
    tracing::debug!(total, kept = kept.len(), "Filter applied");
    kept
}
