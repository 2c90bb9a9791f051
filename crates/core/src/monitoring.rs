//! Tracing setup and Prometheus metrics.

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, info};

/// Initialize tracing and, when a port is given, the Prometheus exporter.
pub fn init_monitoring(json_output: bool, metrics_port: Option<u16>) -> anyhow::Result<()> {
    // Machine-readable stdout must stay clean, so only errors are logged.
    if json_output {
        init_tracing_json();
    } else {
        init_tracing();
    }

    let Some(port) = metrics_port else {
        return Ok(());
    };
    if std::env::var("PORTAL_SCOUT_NO_METRICS").is_ok() {
        return Ok(());
    }

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([127, 0, 0, 1], port))
        .install()?;

    if !json_output {
        info!("Metrics endpoint available at http://localhost:{}/metrics", port);
    }
    Ok(())
}

/// Initialize tracing for JSON output (errors only, to stderr)
fn init_tracing_json() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from("error"))
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Initialize tracing subscriber with default configuration
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portal_scout=info,portal_scout_core=info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_line_number(true)
        .try_init();

    debug!("Tracing initialized");
}

pub fn record_page_fetched(site: &str) {
    counter!("portal_scout_pages_fetched_total", "site" => site.to_string()).increment(1);
}

pub fn record_parsed() {
    counter!("portal_scout_records_parsed_total").increment(1);
}

pub fn record_dropped() {
    counter!("portal_scout_records_dropped_total").increment(1);
}

pub fn record_enrichment_failure(site: &str) {
    counter!("portal_scout_enrichment_failures_total", "site" => site.to_string()).increment(1);
}

/// `outcome` is `success` or `failure`.
pub fn record_run(site: &str, outcome: &'static str) {
    counter!("portal_scout_runs_total", "site" => site.to_string(), "outcome" => outcome)
        .increment(1);
}

/// `status` is `sent`, `skipped` or `failed`.
pub fn record_message(site: &str, status: &'static str) {
    counter!("portal_scout_messages_total", "site" => site.to_string(), "status" => status)
        .increment(1);
}

/// Wall-clock timer that reports into a per-site histogram.
pub struct Timer {
    name: &'static str,
    site: String,
    start: Instant,
}

impl Timer {
    pub fn start(name: &'static str, site: &str) -> Self {
        Self {
            name,
            site: site.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        histogram!(self.name, "site" => self.site.clone()).record(duration.as_secs_f64());
        debug!(timer = self.name, site = %self.site, duration_ms = duration.as_millis() as u64, "Timer finished");
        duration
    }
}
