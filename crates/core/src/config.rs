//! Site configuration.
//!
//! Sites come from a `sites.toml` file when one is found, otherwise from the
//! built-in presets. A `[global]` table supplies defaults that individual
//! sites may leave unset. Everything is validated before a run starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::outbound::OutboundSpec;
use crate::schema::{ElapsedOnMissing, FieldKind, FieldRule, ListingSpec, SpanRule};
use crate::session::LoginSuccess;

/// Upper bound for configured token retries; no unbounded retry loop is allowed.
pub const MAX_TOKEN_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    #[default]
    Form,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginSpec {
    /// Absolute, or relative to the site base URL.
    pub url: String,
    #[serde(default)]
    pub format: PayloadFormat,
    pub identifier_field: String,
    pub secret_field: String,
    #[serde(default)]
    pub extra_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub success: LoginSuccess,
    #[serde(default)]
    pub csrf_header: Option<String>,
    /// Path whose appearance as a final URL means the session expired.
    #[serde(default)]
    pub login_path: Option<String>,
}

/// Names of the environment variables holding the credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialsEnv {
    pub identifier: String,
    pub secret: String,
}

impl CredentialsEnv {
    /// `wg-gesucht-offers` reads `WG_GESUCHT_OFFERS_USERNAME` / `_PASSWORD`.
    pub fn default_for(site: &str) -> Self {
        let prefix: String = site
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        Self {
            identifier: format!("{prefix}_USERNAME"),
            secret: format!("{prefix}_PASSWORD"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchSpec {
    pub url: String,
    /// Ordered pairs; repeated keys are sent as repeated query parameters.
    #[serde(default)]
    pub params: Vec<(String, String)>,
    #[serde(default)]
    pub page_param: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Query parameter that carries the session CSRF token.
    #[serde(default)]
    pub csrf_param: Option<String>,
    /// Fetch once more from the redirect target when a search is redirected.
    #[serde(default)]
    pub refetch_on_redirect: bool,
}

fn default_max_pages() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpSpec {
    /// 0 takes the global default.
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub randomize_headers: bool,
}

impl Default for HttpSpec {
    fn default() -> Self {
        Self {
            timeout_seconds: 0,
            randomize_headers: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPolicy {
    /// 0 takes the global default.
    #[serde(default)]
    pub retries: u32,
    /// 0 takes the global default.
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default)]
    pub cookie_name: Option<String>,
    #[serde(default = "default_token_field")]
    pub field_name: String,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff_ms: 0,
            cookie_name: None,
            field_name: default_token_field(),
        }
    }
}

fn default_token_field() -> String {
    "csrf_token".to_string()
}

impl TokenPolicy {
    pub fn attempts(&self) -> u32 {
        self.retries.max(1)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Bounded jitter window for polite delays.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelayWindow {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayWindow {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn is_zero(&self) -> bool {
        self.max_ms == 0
    }

    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }

    /// Sleep for a sampled duration; a zero window returns immediately.
    pub async fn wait(&self) {
        if self.is_zero() {
            return;
        }
        let delay = self.sample();
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Polite delay");
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteConfig {
    /// Filled from the table key when omitted.
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    pub login: LoginSpec,
    #[serde(default)]
    pub credentials_env: Option<CredentialsEnv>,
    pub search: SearchSpec,
    pub listing: ListingSpec,
    #[serde(default)]
    pub http: HttpSpec,
    #[serde(default)]
    pub token: TokenPolicy,
    #[serde(default)]
    pub detail_delay: Option<DelayWindow>,
    #[serde(default)]
    pub outbound: Option<OutboundSpec>,
}

impl SiteConfig {
    pub fn base(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|e| self.invalid(format!("bad base_url: {e}")))
    }

    /// Resolve an absolute or base-relative URL from the configuration.
    pub fn resolve_url(&self, url: &str) -> Result<Url, ConfigError> {
        self.base()?
            .join(url)
            .map_err(|e| self.invalid(format!("bad url '{url}': {e}")))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_seconds)
    }

    pub fn detail_delay(&self) -> DelayWindow {
        self.detail_delay.unwrap_or_default()
    }

    pub fn credentials_env(&self) -> CredentialsEnv {
        self.credentials_env
            .clone()
            .unwrap_or_else(|| CredentialsEnv::default_for(&self.name))
    }

    fn invalid(&self, reason: String) -> ConfigError {
        ConfigError::Invalid {
            site: self.name.clone(),
            reason,
        }
    }

    fn apply_global(&mut self, global: &GlobalConfig) {
        if self.http.timeout_seconds == 0 {
            self.http.timeout_seconds = global.default_timeout_seconds;
        }
        if self.token.retries == 0 {
            self.token.retries = global.default_token_retries;
        }
        if self.token.backoff_ms == 0 {
            self.token.backoff_ms = global.default_token_backoff_ms;
        }
        if self.detail_delay.is_none() {
            self.detail_delay = Some(DelayWindow::new(0, global.default_detail_delay_max_ms));
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalConfig {
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_token_retries")]
    pub default_token_retries: u32,
    #[serde(default = "default_token_backoff_ms")]
    pub default_token_backoff_ms: u64,
    #[serde(default = "default_detail_delay_max_ms")]
    pub default_detail_delay_max_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
            default_token_retries: default_token_retries(),
            default_token_backoff_ms: default_token_backoff_ms(),
            default_detail_delay_max_ms: default_detail_delay_max_ms(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_token_retries() -> u32 {
    3
}

fn default_token_backoff_ms() -> u64 {
    1000
}

fn default_detail_delay_max_ms() -> u64 {
    10_000
}

/// On-disk `sites.toml` layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SitesConfig {
    #[serde(default)]
    pub global: Option<GlobalConfig>,
    #[serde(default)]
    pub sites: BTreeMap<String, SiteConfig>,
}

impl SitesConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Toml {
            path: origin.to_string(),
            source,
        })
    }

    /// Sites with names filled in and global defaults applied.
    pub fn into_site_configs(self) -> Vec<SiteConfig> {
        let global = self.global.unwrap_or_default();
        self.sites
            .into_iter()
            .map(|(key, mut site)| {
                if site.name.is_empty() {
                    site.name = key;
                }
                site.apply_global(&global);
                site
            })
            .collect()
    }
}

/// Loaded, validated site configurations.
pub struct ConfigManager {
    config_path: Option<PathBuf>,
    sites: Vec<SiteConfig>,
}

impl ConfigManager {
    /// Load from `path`, falling back to the built-in presets when it does not exist.
    pub fn new(path: PathBuf) -> Result<Self, ConfigError> {
        let sites = Self::load_sites(&path)?;
        Ok(Self {
            config_path: Some(path),
            sites,
        })
    }

    /// Resolve the first existing config file, or use the presets.
    pub fn discover() -> Result<Self, ConfigError> {
        match [default_config_path(), local_config_path()]
            .into_iter()
            .find(|p| p.exists())
        {
            Some(path) => Self::new(path),
            None => Ok(Self::builtin()),
        }
    }

    pub fn builtin() -> Self {
        Self {
            config_path: None,
            sites: builtin_sites(),
        }
    }

    fn load_sites(path: &Path) -> Result<Vec<SiteConfig>, ConfigError> {
        if !path.exists() {
            tracing::warn!("Configuration file not found at {:?}, using built-in sites", path);
            return Ok(builtin_sites());
        }
        let sites = SitesConfig::load_from_file(path)?.into_site_configs();
        validate_sites(&sites)?;
        tracing::debug!(count = sites.len(), path = %path.display(), "Loaded site configurations");
        Ok(sites)
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn sites(&self) -> &[SiteConfig] {
        &self.sites
    }

    pub fn site(&self, name: &str) -> Result<&SiteConfig, ConfigError> {
        self.sites
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::UnknownSite(name.to_string()))
    }

    pub fn reload(&mut self) -> Result<(), ConfigError> {
        if let Some(path) = &self.config_path {
            self.sites = Self::load_sites(path)?;
        }
        Ok(())
    }
}

/// Validate site configurations
pub fn validate_sites(sites: &[SiteConfig]) -> Result<(), ConfigError> {
    for site in sites {
        validate_site(site)?;
    }
    Ok(())
}

fn validate_site(site: &SiteConfig) -> Result<(), ConfigError> {
    if site.name.is_empty() {
        return Err(ConfigError::Invalid {
            site: String::new(),
            reason: "site name cannot be empty".into(),
        });
    }
    if site.base_url.is_empty() {
        return Err(site.invalid("base_url cannot be empty".into()));
    }
    site.resolve_url(&site.login.url)?;
    site.resolve_url(&site.search.url)?;
    if site.http.timeout_seconds == 0 {
        return Err(site.invalid("timeout must be greater than 0".into()));
    }
    if site.token.retries > MAX_TOKEN_RETRIES {
        return Err(site.invalid(format!(
            "token retries {} exceed the maximum of {MAX_TOKEN_RETRIES}",
            site.token.retries
        )));
    }
    if site.search.max_pages == 0 {
        return Err(site.invalid("max_pages must be at least 1".into()));
    }
    let mut windows = vec![("detail_delay", site.detail_delay())];
    if let Some(outbound) = &site.outbound {
        windows.push(("outbound.delay", outbound.delay));
    }
    for (label, window) in windows {
        if window.min_ms > window.max_ms {
            return Err(site.invalid(format!(
                "{label} min {} exceeds max {}",
                window.min_ms, window.max_ms
            )));
        }
    }
    site.listing.compile().map_err(|e| match e {
        ConfigError::Invalid { reason, .. } => site.invalid(reason),
        other => other,
    })?;
    Ok(())
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("PORTAL_SCOUT_CONFIG_DIR") {
        PathBuf::from(config_dir).join("sites.toml")
    } else {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("portal-scout")
            .join("sites.toml")
    }
}

/// Get the local configuration file path (for development)
pub fn local_config_path() -> PathBuf {
    PathBuf::from("config").join("sites.toml")
}

/// Built-in site presets with global defaults applied.
pub fn builtin_sites() -> Vec<SiteConfig> {
    let global = GlobalConfig::default();
    let mut sites = vec![
        freelancermap(),
        freelance_de(),
        wg_gesucht_offers(),
        wg_gesucht_requests(),
    ];
    for site in &mut sites {
        site.apply_global(&global);
    }
    sites
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn map(items: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs(items).into_iter().collect()
}

fn env(identifier: &str, secret: &str) -> Option<CredentialsEnv> {
    Some(CredentialsEnv {
        identifier: identifier.into(),
        secret: secret.into(),
    })
}

fn freelancermap() -> SiteConfig {
    SiteConfig {
        name: "freelancermap".into(),
        base_url: "https://www.freelancermap.com/".into(),
        login: LoginSpec {
            url: "/login".into(),
            format: PayloadFormat::Form,
            identifier_field: "login".into(),
            secret_field: "password".into(),
            extra_fields: map(&[("_remember_me", "0")]),
            headers: BTreeMap::new(),
            success: LoginSuccess::StatusOk,
            csrf_header: None,
            login_path: Some("/login".into()),
        },
        credentials_env: env("FREELANCERMAP_USERNAME", "FREELANCERMAP_PASSWORD"),
        search: SearchSpec {
            url: "/app/pobox/main".into(),
            params: Vec::new(),
            page_param: None,
            max_pages: 1,
            csrf_param: None,
            refetch_on_redirect: false,
        },
        listing: ListingSpec {
            container: "div.subject.d-flex.table-layout-only".into(),
            exclude: None,
            fields: vec![
                FieldRule::new("title", FieldKind::Text)
                    .selector("a.text-truncate")
                    .required(),
                FieldRule::new("link", FieldKind::Link)
                    .selector("a.text-truncate")
                    .attr("href")
                    .required(),
                FieldRule::new("date", FieldKind::Date)
                    .selector("span.date")
                    .date_format("%d.%m.%Y, %H:%M"),
                FieldRule::new("content", FieldKind::Text).detail("link", None),
            ],
            spans: Vec::new(),
        },
        http: HttpSpec::default(),
        token: TokenPolicy::default(),
        detail_delay: None,
        outbound: None,
    }
}

fn freelance_de() -> SiteConfig {
    SiteConfig {
        name: "freelance-de".into(),
        base_url: "https://www.freelance.de/".into(),
        login: LoginSpec {
            url: "/login.php".into(),
            format: PayloadFormat::Form,
            identifier_field: "username".into(),
            secret_field: "password".into(),
            extra_fields: map(&[
                ("action", "login"),
                ("seal", ""),
                ("fromPage", ""),
                ("service", ""),
                ("redirect_url", ""),
                ("remember", ""),
                ("login", "Anmelden"),
            ]),
            headers: map(&[("Origin", "https://www.freelance.de")]),
            success: LoginSuccess::BodyMarker {
                markers: vec!["Kontaktdaten anzeigen".into(), "logout".into()],
            },
            csrf_header: None,
            login_path: Some("/login.php".into()),
        },
        credentials_env: env("FREELANCE_DE_USERNAME", "FREELANCE_DE_PASSWORD"),
        search: SearchSpec {
            url: "/projekte".into(),
            params: pairs(&[("sortBy", "last_update"), ("lastUpdate", "today")]),
            page_param: None,
            max_pages: 1,
            csrf_param: None,
            refetch_on_redirect: false,
        },
        listing: ListingSpec {
            container: "search-project-card".into(),
            exclude: None,
            fields: vec![
                FieldRule::new("link", FieldKind::Link)
                    .selector("a.card")
                    .attr("href")
                    .required(),
                FieldRule::new("title", FieldKind::Text).selector("a.card"),
                FieldRule::new("description", FieldKind::Text)
                    .detail("link", Some("div.panel-body.highlight-text"))
                    .fallback("No description available."),
            ],
            spans: Vec::new(),
        },
        http: HttpSpec::default(),
        token: TokenPolicy::default(),
        detail_delay: None,
        outbound: None,
    }
}

fn wg_gesucht_login() -> LoginSpec {
    LoginSpec {
        url: "/ajax/sessions.php?action=login".into(),
        format: PayloadFormat::Json,
        identifier_field: "login_email_username".into(),
        secret_field: "login_password".into(),
        extra_fields: map(&[
            ("login_form_auto_login", "1"),
            ("display_language", "de"),
        ]),
        headers: map(&[
            ("Accept", "application/json"),
            ("Origin", "https://www.wg-gesucht.de"),
            ("X-Client-Id", "wg_desktop_website"),
            ("X-Requested-With", "XMLHttpRequest"),
            ("X-Smp-Client", "WG-Gesucht"),
        ]),
        success: LoginSuccess::JsonTokens {
            accepted_statuses: vec![200, 202],
            access_token_paths: vec!["access_token".into(), "detail.token".into()],
            csrf_token_path: Some("csrf_token".into()),
        },
        csrf_header: Some("X-CSRF-Token".into()),
        login_path: None,
    }
}

fn title_and_link() -> [FieldRule; 2] {
    [
        FieldRule::new("title", FieldKind::Text)
            .selector("h3.truncate_title")
            .fallback("No title"),
        FieldRule::new("link", FieldKind::Link)
            .selector("h3.truncate_title a")
            .attr("href"),
    ]
}

fn wg_gesucht_offers() -> SiteConfig {
    let mut fields = title_and_link().to_vec();
    fields.extend([
        FieldRule::new("price", FieldKind::Integer).selector("div.col-xs-3"),
        FieldRule::new("room_size", FieldKind::Integer)
            .selector("div.col-xs-3.text-right")
            .pattern(r"\d+"),
        FieldRule::new("room_count", FieldKind::Integer)
            .selector("div.col-xs-11")
            .pattern(r"(\d+)-Zimmer"),
        FieldRule::new("city_area", FieldKind::Text)
            .selector("div.col-xs-11")
            .segment("|", 1)
            .fallback("Unknown"),
        FieldRule::new("street", FieldKind::Text)
            .selector("div.col-xs-11")
            .segment("|", 2)
            .fallback("Unknown"),
        FieldRule::new("availability_start", FieldKind::Date)
            .selector("div.col-xs-5.text-center")
            .segment(" - ", 0),
        FieldRule::new("availability_end", FieldKind::Date)
            .selector("div.col-xs-5.text-center")
            .segment(" - ", 1),
        FieldRule::new("furnished", FieldKind::Boolean).pattern("(?i)möbliert"),
        FieldRule::new("ad_person", FieldKind::Text)
            .selector("span.ml5")
            .fallback("Unknown"),
    ]);
    SiteConfig {
        name: "wg-gesucht-offers".into(),
        base_url: "https://www.wg-gesucht.de/".into(),
        login: wg_gesucht_login(),
        credentials_env: env("WG_USERNAME", "WG_PASSWORD"),
        search: SearchSpec {
            url: "/wohnungen-in-Berlin.8.2.1.0.html".into(),
            params: pairs(&[
                ("offer_filter", "1"),
                ("city_id", "8"),
                ("sort_order", "0"),
                ("noDeact", "1"),
                ("categories[]", "2"),
            ]),
            page_param: None,
            max_pages: 1,
            csrf_param: None,
            refetch_on_redirect: true,
        },
        listing: ListingSpec {
            container: "div.offer_list_item".into(),
            exclude: None,
            fields,
            spans: vec![SpanRule {
                name: "stay_length_days".into(),
                start: "availability_start".into(),
                end: "availability_end".into(),
            }],
        },
        http: HttpSpec::default(),
        token: TokenPolicy::default(),
        detail_delay: None,
        outbound: Some(OutboundSpec::default()),
    }
}

fn wg_gesucht_requests() -> SiteConfig {
    let mut fields = title_and_link().to_vec();
    fields.extend([
        FieldRule::new("name", FieldKind::Text)
            .selector("div.col-sm-12.flex_space_between span")
            .segment(", ", 0)
            .fallback("Unknown"),
        FieldRule::new("age", FieldKind::Integer)
            .selector("div.col-sm-12.flex_space_between span")
            .segment(", ", 1),
        FieldRule::new("online_duration", FieldKind::Elapsed)
            .selector("span[style*='#218700']")
            .on_missing(ElapsedOnMissing::Unbounded),
        FieldRule::new("description", FieldKind::Text)
            .detail("link", Some("#freetext_description p.freitext"))
            .fallback("Description unavailable."),
    ]);
    SiteConfig {
        name: "wg-gesucht-requests".into(),
        base_url: "https://www.wg-gesucht.de/".into(),
        login: wg_gesucht_login(),
        credentials_env: env("WG_USERNAME", "WG_PASSWORD"),
        search: SearchSpec {
            url: "/wohnungen-in-Berlin-gesucht.8.2.1.0.html".into(),
            params: pairs(&[
                ("city_id", "8"),
                ("sort_column", "0"),
                ("sort_order", "0"),
                ("noDeact", "1"),
                ("categories[]", "2"),
                ("exContAds", "1"),
            ]),
            page_param: None,
            max_pages: 1,
            csrf_param: Some("csrf_token".into()),
            refetch_on_redirect: false,
        },
        listing: ListingSpec {
            container: "div.wgg_card.request_list_item".into(),
            exclude: Some("img.overlay.placeholder_denied_female".into()),
            fields,
            spans: Vec::new(),
        },
        http: HttpSpec::default(),
        token: TokenPolicy::default(),
        detail_delay: None,
        outbound: None,
    }
}
