use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};

use portal_scout_core::attachments::{MailMessage, filter_attachments};
use portal_scout_core::config::{ConfigManager, SiteConfig};
use portal_scout_core::filter::{ElapsedLimit, ElapsedUnit, KeywordList, MatchMode};
use portal_scout_core::outbound::ApplicationItem;
use portal_scout_core::query::normalize_keywords;
use portal_scout_core::schema::FieldKind;
use portal_scout_core::{Credentials, Orchestrator, RunOutcome, RunRequest, RunState};
use portal_scout_core::{monitoring, output};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Json,
    Table,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Mode {
    Substring,
    Word,
}

#[derive(Debug, Parser)]
#[command(
    name = "portal-scout",
    version,
    about = "Authenticated listing scraper and filter"
)]
struct Cli {
    /// Path to sites.toml (default: platform config dir, then ./config/sites.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format: json or table
    #[arg(long, value_enum, default_value_t = OutputFormat::Json, global = true)]
    format: OutputFormat,

    /// Serve Prometheus metrics on this port while running
    #[arg(long, global = true)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the search pipeline against one or more sites concurrently
    Search(SearchArgs),
    /// Send application messages through a site's outbound configuration
    Apply {
        site: String,
        /// JSON array of {listing_url, recipient_name, message}
        #[arg(long)]
        input: PathBuf,
    },
    /// Select invoice/receipt PDF attachments from a JSON list of messages
    Attachments {
        #[arg(long)]
        input: PathBuf,
        /// Additional content keywords (repeatable or comma-separated)
        #[arg(long = "keyword")]
        keywords: Vec<String>,
    },
    /// List configured sites
    Sites,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(required = true)]
    sites: Vec<String>,

    /// JSON file with a full run request (params, criteria, limit)
    #[arg(long)]
    request: Option<PathBuf>,

    /// Comma-separated keywords of which at least one must match
    #[arg(long)]
    positive: Option<String>,

    /// Comma-separated keywords of which none may match
    #[arg(long)]
    negative: Option<String>,

    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Drop listings older than this many days
    #[arg(long, conflicts_with = "max_elapsed_hours")]
    max_elapsed_days: Option<i64>,

    /// Drop listings older than this many hours
    #[arg(long)]
    max_elapsed_hours: Option<i64>,

    /// Field the age bound applies to (default: first elapsed or date field)
    #[arg(long)]
    elapsed_field: Option<String>,

    /// Limit results per site
    #[arg(long)]
    limit: Option<usize>,

    /// Extra search parameter, key=value (repeatable)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

fn load_config(path: Option<&PathBuf>) -> Result<ConfigManager> {
    let manager = match path {
        Some(p) => ConfigManager::new(p.clone()),
        None => ConfigManager::discover(),
    }
    .context("failed to load site configuration")?;
    Ok(manager)
}

fn credentials_for(site: &SiteConfig) -> Result<Credentials, String> {
    let env = site.credentials_env();
    match (
        std::env::var(&env.identifier),
        std::env::var(&env.secret),
    ) {
        (Ok(id), Ok(secret)) if !id.is_empty() => Ok(Credentials::new(id, secret)),
        _ => Err(format!(
            "missing credentials: set {} and {}",
            env.identifier, env.secret
        )),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

/// First elapsed field, else first date field.
fn default_age_field(site: &SiteConfig) -> Option<String> {
    let fields = &site.listing.fields;
    fields
        .iter()
        .find(|f| f.kind == FieldKind::Elapsed)
        .or_else(|| fields.iter().find(|f| f.kind == FieldKind::Date))
        .map(|f| f.name.clone())
}

fn request_for(base: &RunRequest, args: &SearchArgs, site: &SiteConfig) -> Result<RunRequest, String> {
    let mut request = base.clone();
    request.params.extend(args.params.iter().cloned());
    if let Some(p) = &args.positive {
        request.criteria.positive_keywords = KeywordList::Csv(p.clone());
    }
    if let Some(n) = &args.negative {
        request.criteria.negative_keywords = KeywordList::Csv(n.clone());
    }
    if let Some(mode) = args.mode {
        request.criteria.match_mode = match mode {
            Mode::Substring => MatchMode::Substring,
            Mode::Word => MatchMode::WordBoundary,
        };
    }
    let bound = match (args.max_elapsed_days, args.max_elapsed_hours) {
        (Some(d), _) => Some((d, ElapsedUnit::Days)),
        (None, Some(h)) => Some((h, ElapsedUnit::Hours)),
        (None, None) => None,
    };
    if let Some((amount, unit)) = bound {
        let field = args
            .elapsed_field
            .clone()
            .or_else(|| default_age_field(site))
            .ok_or_else(|| format!("site '{}' has no elapsed or date field", site.name))?;
        request.criteria.max_elapsed = Some(ElapsedLimit {
            field,
            amount,
            unit,
        });
    }
    if args.limit.is_some() {
        request.limit = args.limit;
    }
    Ok(request)
}

async fn run_site(site: SiteConfig, base: &RunRequest, args: &SearchArgs) -> (String, RunOutcome) {
    let name = site.name.clone();
    let failure = |error: String| RunOutcome::Failure {
        error,
        stage: RunState::Init,
    };
    let credentials = match credentials_for(&site) {
        Ok(c) => c,
        Err(e) => return (name, failure(e)),
    };
    let request = match request_for(base, args, &site) {
        Ok(r) => r,
        Err(e) => return (name, failure(e)),
    };
    let orchestrator = match Orchestrator::new(site) {
        Ok(o) => o,
        Err(e) => return (name, failure(e.to_string())),
    };
    let outcome = orchestrator.run(&credentials, &request).await;
    (name, outcome)
}

async fn search(manager: &ConfigManager, args: SearchArgs, format: OutputFormat) -> Result<ExitCode> {
    let base = match &args.request {
        Some(path) => read_json::<RunRequest>(path).await?,
        None => RunRequest::default(),
    };
    let mut sites = Vec::new();
    for name in &args.sites {
        sites.push(manager.site(name)?.clone());
    }

    let runs = sites.into_iter().map(|site| run_site(site, &base, &args));
    let outcomes: Vec<(String, RunOutcome)> = futures::future::join_all(runs).await;

    match format {
        OutputFormat::Json => {
            let by_site: BTreeMap<&str, &RunOutcome> =
                outcomes.iter().map(|(s, o)| (s.as_str(), o)).collect();
            output::print_pretty_json(&by_site);
        }
        OutputFormat::Table => output::print_outcomes_table(&outcomes),
    }

    let failed = outcomes.iter().filter(|(_, o)| !o.is_success()).count();
    if failed > 0 {
        tracing::warn!(failed, total = outcomes.len(), "Some runs failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn apply(manager: &ConfigManager, site: &str, input: &PathBuf) -> Result<ExitCode> {
    let site = manager.site(site)?.clone();
    let items: Vec<ApplicationItem> = read_json(input).await?;
    let credentials = credentials_for(&site).map_err(anyhow::Error::msg)?;
    let orchestrator = Orchestrator::new(site)?;
    let report = orchestrator.send_applications(&credentials, &items).await?;
    output::print_pretty_json(&report);
    Ok(ExitCode::SUCCESS)
}

async fn attachments(input: &PathBuf, keywords: &[String]) -> Result<ExitCode> {
    let raw: Value = read_json(input).await?;
    let messages: Vec<MailMessage> = match raw {
        Value::Array(_) => serde_json::from_value(raw)?,
        other => vec![serde_json::from_value(other)?],
    };
    let report = filter_attachments(&messages, &normalize_keywords(keywords))?;
    output::print_pretty_json(&report);
    Ok(ExitCode::SUCCESS)
}

fn list_sites(manager: &ConfigManager, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let sites: Vec<Value> = manager
                .sites()
                .iter()
                .map(|s| {
                    json!({
                        "name": s.name,
                        "base_url": s.base_url,
                        "outbound": s.outbound.is_some(),
                    })
                })
                .collect();
            output::print_pretty_json(&sites);
        }
        OutputFormat::Table => {
            for s in manager.sites() {
                println!("{:<24} {}", s.name, s.base_url);
            }
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    monitoring::init_monitoring(cli.format == OutputFormat::Json, cli.metrics_port)?;

    match cli.command {
        Command::Attachments { input, keywords } => attachments(&input, &keywords).await,
        Command::Sites => {
            let manager = load_config(cli.config.as_ref())?;
            list_sites(&manager, cli.format);
            Ok(ExitCode::SUCCESS)
        }
        Command::Search(args) => {
            let manager = load_config(cli.config.as_ref())?;
            search(&manager, args, cli.format).await
        }
        Command::Apply { site, input } => {
            let manager = load_config(cli.config.as_ref())?;
            apply(&manager, &site, &input).await
        }
    }
}
