//! Request header randomization.
//!
//! Header values are drawn from fixed pools of real browser values so that
//! consecutive requests of one session do not share an identical fingerprint.
//! Nothing here influences how responses are parsed.

use rand::Rng;
use rand::seq::SliceRandom;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT,
};

/// Modern browser user agents for rotation
static USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:98.0) Gecko/20100101 Firefox/98.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

/// Accept-Language headers for randomization
static ACCEPT_LANGUAGES: &[&str] = &[
    "de-DE,de;q=0.9,en-US;q=0.8,en;q=0.7",
    "en-US,en;q=0.9,de;q=0.8,fr;q=0.7",
    "en-GB,en;q=0.9,en-US;q=0.8,de;q=0.7",
    "fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7",
];

static ACCEPT_ENCODINGS: &[&str] = &["gzip, deflate, br", "gzip, deflate"];

const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

/// Per-session header policy. Immutable once the session is built.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderProfile {
    pub randomize: bool,
}

impl HeaderProfile {
    pub fn new(randomize: bool) -> Self {
        Self { randomize }
    }

    pub fn user_agent(&self) -> &'static str {
        self.pick(USER_AGENTS)
    }

    pub fn accept_language(&self) -> &'static str {
        self.pick(ACCEPT_LANGUAGES)
    }

    fn pick(&self, pool: &'static [&'static str]) -> &'static str {
        if self.randomize {
            let mut rng = rand::thread_rng();
            pool.choose(&mut rng).copied().unwrap_or(pool[0])
        } else {
            pool[0]
        }
    }

    /// Browser-like header set for one request.
    pub fn generate_headers(&self, referer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(self.user_agent()));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static(self.accept_language()),
        );
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        if let Some(r) = referer.and_then(|r| HeaderValue::from_str(r).ok()) {
            headers.insert(REFERER, r);
        }
        if self.randomize {
            let mut rng = rand::thread_rng();
            headers.insert(
                HeaderName::from_static("accept-encoding"),
                HeaderValue::from_static(self.pick(ACCEPT_ENCODINGS)),
            );
            if rng.gen_bool(0.3) {
                headers.insert(HeaderName::from_static("dnt"), HeaderValue::from_static("1"));
            }
            headers.insert(
                HeaderName::from_static("upgrade-insecure-requests"),
                HeaderValue::from_static("1"),
            );
        }
        headers
    }
}

/// Build a header map from configured name/value pairs, skipping invalid entries.
pub fn header_map_from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            }
            _ => tracing::warn!(header = %name, "Skipping invalid configured header"),
        }
    }
    headers
}
