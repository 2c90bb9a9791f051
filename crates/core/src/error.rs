//! Error taxonomy for the scraping pipeline.
//!
//! Every component owns a `thiserror` enum; [`ScoutError`] folds them together
//! so the orchestrator can propagate with `?` and convert to a structured
//! outcome at its boundary.

use reqwest::StatusCode;
use thiserror::Error;

/// Login endpoint rejected the credentials or could not be reached.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("network error during login at {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("login rejected with HTTP {status}")]
    Status { status: StatusCode },
    #[error("login rejected: {reason}")]
    Rejected { reason: String },
    #[error("invalid login configuration: {0}")]
    Config(String),
}

/// CSRF/session token could not be obtained within the retry budget.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no token found at {url} after {attempts} attempt(s); last failure: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: String,
    },
}

/// A single HTTP request failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP status {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("network error for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("session expired while fetching {url}")]
    SessionExpired { url: String },
}

impl FetchError {
    /// Timeouts, connection failures, 429 and 5xx are worth retrying by a caller.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Network { .. } => true,
            FetchError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            FetchError::InvalidUrl { .. } | FetchError::SessionExpired { .. } => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::SessionExpired { .. } => Some(StatusCode::UNAUTHORIZED),
            _ => None,
        }
    }
}

/// One record could not be built. Never aborts a run.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("required field '{field}' missing")]
    MissingRequired { field: String },
}

/// Malformed filter criteria, detected before any network I/O.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter references unknown field '{0}'")]
    UnknownField(String),
    #[error("field '{field}' is {actual}, but the {clause} clause needs {expected}")]
    FieldKind {
        field: String,
        clause: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("numeric range for '{field}' has min {min} greater than max {max}")]
    InvertedRange { field: String, min: i64, max: i64 },
    #[error("negative elapsed bound for '{0}'")]
    NegativeElapsed(String),
    #[error("categorical clause for '{0}' allows no values")]
    EmptyCategory(String),
    #[error("invalid keyword pattern '{keyword}': {source}")]
    Keyword {
        keyword: String,
        #[source]
        source: regex::Error,
    },
}

/// Site configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid selector '{selector}': {reason}")]
    Selector { selector: String, reason: String },
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("site '{site}': {reason}")]
    Invalid { site: String, reason: String },
    #[error("unknown site '{0}'")]
    UnknownSite(String),
}

/// Outbound message batch was aborted.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("site '{0}' has no outbound configuration")]
    NotConfigured(String),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("message to {url} rejected with HTTP {status}: {body}")]
    Rejected {
        status: StatusCode,
        url: String,
        body: String,
    },
}

#[derive(Debug, Error)]
pub enum ScoutError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("token acquisition failed: {0}")]
    Token(#[from] TokenError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
}
