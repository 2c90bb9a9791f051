//! Session Manager.
//!
//! Owns login, cookie lifetime and token acquisition. A [`Session`] is created
//! once per run by [`authenticate`] and passed by reference to the fetcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::anti_detection::{HeaderProfile, header_map_from_pairs};
use crate::config::{PayloadFormat, SiteConfig, TokenPolicy};
use crate::error::{AuthError, FetchError, TokenError};
use crate::fetcher::{self, PageContent, build_http_client};
use crate::models::Credentials;

const DEFAULT_CSRF_HEADER: &str = "X-CSRF-Token";

/// Tokens derived from the login response.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionTokens {
    pub bearer: Option<String>,
    pub csrf: Option<String>,
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens")
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .field("csrf", &self.csrf.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Decides whether a login response means success, and which tokens it carries.
pub trait LoginVerifier: Send + Sync {
    fn verify(&self, status: StatusCode, body: &str) -> Result<SessionTokens, String>;
}

/// Configurable success predicates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoginSuccess {
    /// Any 2xx response.
    #[default]
    StatusOk,
    /// 2xx and the body contains at least one marker.
    BodyMarker { markers: Vec<String> },
    /// JSON body with an access and/or CSRF token at dotted paths.
    JsonTokens {
        #[serde(default = "default_accepted_statuses")]
        accepted_statuses: Vec<u16>,
        #[serde(default = "default_access_token_paths")]
        access_token_paths: Vec<String>,
        #[serde(default)]
        csrf_token_path: Option<String>,
    },
}

fn default_accepted_statuses() -> Vec<u16> {
    vec![200]
}

fn default_access_token_paths() -> Vec<String> {
    vec!["access_token".to_string()]
}

fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    path.split('.')
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

impl LoginVerifier for LoginSuccess {
    fn verify(&self, status: StatusCode, body: &str) -> Result<SessionTokens, String> {
        match self {
            LoginSuccess::StatusOk => Ok(SessionTokens::default()),
            LoginSuccess::BodyMarker { markers } => {
                if markers.iter().any(|m| body.contains(m.as_str())) {
                    Ok(SessionTokens::default())
                } else {
                    Err("no success marker in login response".to_string())
                }
            }
            LoginSuccess::JsonTokens {
                accepted_statuses,
                access_token_paths,
                csrf_token_path,
            } => {
                if !accepted_statuses.contains(&status.as_u16()) {
                    return Err(format!("unexpected login status {status}"));
                }
                let json: Value = serde_json::from_str(body)
                    .map_err(|e| format!("login response is not JSON: {e}"))?;
                let tokens = SessionTokens {
                    bearer: access_token_paths
                        .iter()
                        .find_map(|p| json_path(&json, p))
                        .map(str::to_string),
                    csrf: csrf_token_path
                        .as_deref()
                        .and_then(|p| json_path(&json, p))
                        .map(str::to_string),
                };
                if tokens.bearer.is_none() && tokens.csrf.is_none() {
                    return Err("login response carried no token".to_string());
                }
                Ok(tokens)
            }
        }
    }
}

/// Authenticated handle. Never persisted, never shared between runs.
pub struct Session {
    site: String,
    client: Client,
    jar: Arc<Jar>,
    base_url: Url,
    default_headers: HeaderMap,
    tokens: SessionTokens,
    profile: HeaderProfile,
    login_path: Option<String>,
    expired: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("site", &self.site)
            .field("base_url", &self.base_url.as_str())
            .field("tokens", &self.tokens)
            .field("expired", &self.is_expired())
            .finish()
    }
}

impl Session {
    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn tokens(&self) -> &SessionTokens {
        &self.tokens
    }

    pub fn login_path(&self) -> Option<&str> {
        self.login_path.as_deref()
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Relaxed)
    }

    pub(crate) fn expire(&self) {
        self.expired.store(true, Ordering::Relaxed);
    }

    /// Per-request headers: a fresh profile draw, then the session's token headers.
    pub fn request_headers(&self, referer: Option<&str>) -> HeaderMap {
        let mut headers = self.profile.generate_headers(referer);
        headers.extend(self.default_headers.clone());
        headers
    }

    /// Current value of a cookie visible to `url`.
    pub fn cookie_value(&self, url: &Url, name: &str) -> Option<String> {
        let header = self.jar.cookies(url)?;
        let raw = header.to_str().ok()?;
        raw.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    }
}

fn token_header(value: &str) -> Result<HeaderValue, AuthError> {
    HeaderValue::from_str(value).map_err(|_| AuthError::Rejected {
        reason: "token is not a valid header value".to_string(),
    })
}

/// Log in with the site's configured success predicate.
pub async fn authenticate(site: &SiteConfig, credentials: &Credentials) -> Result<Session, AuthError> {
    authenticate_with(site, credentials, &site.login.success).await
}

/// Log in with a caller-supplied success predicate.
///
/// Cookies are primed with a GET to the base URL, then the credentials are
/// posted. No partial session is returned on failure.
pub async fn authenticate_with(
    site: &SiteConfig,
    credentials: &Credentials,
    verifier: &dyn LoginVerifier,
) -> Result<Session, AuthError> {
    let base_url = site.base().map_err(|e| AuthError::Config(e.to_string()))?;
    let login_url = site
        .resolve_url(&site.login.url)
        .map_err(|e| AuthError::Config(e.to_string()))?;
    let jar = Arc::new(Jar::default());
    let client = build_http_client(site.timeout(), jar.clone()).map_err(AuthError::Client)?;
    let profile = HeaderProfile::new(site.http.randomize_headers);

    tracing::debug!(site = %site.name, url = %base_url, "Priming session cookies");
    client
        .get(base_url.clone())
        .headers(profile.generate_headers(None))
        .send()
        .await
        .map_err(|source| AuthError::Network {
            url: base_url.to_string(),
            source,
        })?;

    let login = &site.login;
    let mut headers = profile.generate_headers(Some(login_url.as_str()));
    headers.extend(header_map_from_pairs(
        login.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    ));
    let request = client.post(login_url.clone()).headers(headers);
    let request = match login.format {
        PayloadFormat::Form => {
            let mut form: Vec<(&str, &str)> = vec![
                (login.identifier_field.as_str(), credentials.identifier.as_str()),
                (login.secret_field.as_str(), credentials.secret.as_str()),
            ];
            form.extend(login.extra_fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            request.form(&form)
        }
        PayloadFormat::Json => {
            let mut body = serde_json::Map::new();
            body.insert(
                login.identifier_field.clone(),
                Value::String(credentials.identifier.clone()),
            );
            body.insert(
                login.secret_field.clone(),
                Value::String(credentials.secret.clone()),
            );
            for (k, v) in &login.extra_fields {
                body.insert(k.clone(), Value::String(v.clone()));
            }
            request.json(&body)
        }
    };

    let network = |source| AuthError::Network {
        url: login_url.to_string(),
        source,
    };
    let resp = request.send().await.map_err(network)?;
    let status = resp.status();
    let body = resp.text().await.map_err(network)?;
    if !status.is_success() {
        tracing::warn!(site = %site.name, %status, "Login rejected");
        return Err(AuthError::Status { status });
    }
    let tokens = verifier
        .verify(status, &body)
        .map_err(|reason| AuthError::Rejected { reason })?;

    let mut default_headers = HeaderMap::new();
    if let Some(bearer) = &tokens.bearer {
        default_headers.insert(AUTHORIZATION, token_header(&format!("Bearer {bearer}"))?);
    }
    if let Some(csrf) = &tokens.csrf {
        let name = login.csrf_header.as_deref().unwrap_or(DEFAULT_CSRF_HEADER);
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AuthError::Config(format!("invalid csrf header '{name}': {e}")))?;
        default_headers.insert(name, token_header(csrf)?);
    }

    tracing::info!(
        site = %site.name,
        bearer = tokens.bearer.is_some(),
        csrf = tokens.csrf.is_some(),
        "Login successful"
    );
    Ok(Session {
        site: site.name.clone(),
        client,
        jar,
        base_url,
        default_headers,
        tokens,
        profile,
        login_path: login.login_path.clone(),
        expired: AtomicBool::new(false),
    })
}

fn token_from_html(body: &str, field: &str) -> Option<String> {
    let doc = Html::parse_document(body);
    let input = Selector::parse(&format!("input[name=\"{field}\"]")).ok()?;
    let meta = Selector::parse("meta[name=\"csrf-token\"]").ok()?;
    doc.select(&input)
        .find_map(|el| el.value().attr("value"))
        .or_else(|| doc.select(&meta).find_map(|el| el.value().attr("content")))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Fetch a CSRF token from `url`, retrying with fixed backoff.
pub async fn fetch_token(
    session: &Session,
    url: &str,
    policy: &TokenPolicy,
) -> Result<String, TokenError> {
    fetch_token_with_page(session, url, policy)
        .await
        .map(|(token, _)| token)
}

/// Like [`fetch_token`], also returning the page the token was found on.
///
/// Each attempt checks the response cookies, the cookie jar and the page's
/// hidden input / meta tag.
pub async fn fetch_token_with_page(
    session: &Session,
    url: &str,
    policy: &TokenPolicy,
) -> Result<(String, PageContent), TokenError> {
    let attempts = policy.attempts();
    let mut last = String::from("no attempt made");
    for attempt in 1..=attempts {
        match fetcher::fetch(session, url, &[], None).await {
            Ok(page) => {
                let from_cookie = policy.cookie_name.as_deref().and_then(|name| {
                    page.cookie(name).map(str::to_string).or_else(|| {
                        Url::parse(&page.final_url)
                            .ok()
                            .and_then(|u| session.cookie_value(&u, name))
                    })
                });
                if let Some(token) =
                    from_cookie.or_else(|| token_from_html(&page.body, &policy.field_name))
                {
                    tracing::debug!(site = %session.site(), attempt, "Token acquired");
                    return Ok((token, page));
                }
                last = format!("no '{}' token in page", policy.field_name);
            }
            Err(e @ FetchError::SessionExpired { .. }) => {
                last = e.to_string();
                break;
            }
            Err(e) => last = e.to_string(),
        }
        tracing::warn!(site = %session.site(), attempt, attempts, reason = %last, "Token fetch failed");
        if attempt < attempts {
            tokio::time::sleep(policy.backoff()).await;
        }
    }
    Err(TokenError::Exhausted {
        url: url.to_string(),
        attempts,
        last,
    })
}

/// Unauthenticated session for tests.
#[cfg(test)]
pub(crate) fn test_session(base: &str) -> Session {
    let jar = Arc::new(Jar::default());
    Session {
        site: "test".to_string(),
        client: build_http_client(std::time::Duration::from_secs(5), jar.clone()).unwrap(),
        jar,
        base_url: Url::parse(base).unwrap(),
        default_headers: HeaderMap::new(),
        tokens: SessionTokens::default(),
        profile: HeaderProfile::new(false),
        login_path: Some("/login".to_string()),
        expired: AtomicBool::new(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builtin_sites;
    use mockito::{Matcher, Server};

    fn site_for(server: &Server, format: PayloadFormat, success: LoginSuccess) -> SiteConfig {
        let mut site = builtin_sites().remove(0);
        site.name = "mock".into();
        site.base_url = server.url();
        site.login.url = "/login".into();
        site.login.format = format;
        site.login.identifier_field = "user".into();
        site.login.secret_field = "pass".into();
        site.login.extra_fields.clear();
        site.login.success = success;
        site.http.randomize_headers = false;
        site
    }

    fn creds() -> Credentials {
        Credentials::new("alice", "s3cret")
    }

    #[test]
    fn json_tokens_accepts_nested_paths() {
        let verifier = LoginSuccess::JsonTokens {
            accepted_statuses: vec![200, 202],
            access_token_paths: vec!["access_token".into(), "detail.token".into()],
            csrf_token_path: Some("csrf_token".into()),
        };
        let tokens = verifier
            .verify(StatusCode::ACCEPTED, r#"{"detail":{"token":"abc"}}"#)
            .unwrap();
        assert_eq!(tokens.bearer.as_deref(), Some("abc"));
        assert!(tokens.csrf.is_none());
        assert!(verifier.verify(StatusCode::OK, r#"{"ok":true}"#).is_err());
        assert!(verifier.verify(StatusCode::CREATED, r#"{"access_token":"x"}"#).is_err());
    }

    #[test]
    fn body_marker_requires_marker() {
        let verifier = LoginSuccess::BodyMarker {
            markers: vec!["logout".into()],
        };
        assert!(verifier.verify(StatusCode::OK, "<a>logout</a>").is_ok());
        assert!(verifier.verify(StatusCode::OK, "<a>login</a>").is_err());
    }

    #[test]
    fn token_debug_is_redacted() {
        let tokens = SessionTokens {
            bearer: Some("secret-bearer".into()),
            csrf: None,
        };
        assert!(!format!("{tokens:?}").contains("secret-bearer"));
    }

    #[tokio::test]
    async fn form_login_primes_cookies_and_posts() {
        let mut server = Server::new_async().await;
        let prime = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("set-cookie", "PHPSESSID=xyz; Path=/")
            .create_async()
            .await;
        let login = server
            .mock("POST", "/login")
            .match_header("cookie", Matcher::Regex("PHPSESSID=xyz".into()))
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("user".into(), "alice".into()),
                Matcher::UrlEncoded("pass".into(), "s3cret".into()),
            ]))
            .with_status(200)
            .with_body("welcome, logout")
            .create_async()
            .await;
        let site = site_for(
            &server,
            PayloadFormat::Form,
            LoginSuccess::BodyMarker {
                markers: vec!["logout".into()],
            },
        );
        let session = authenticate(&site, &creds()).await.unwrap();
        prime.assert_async().await;
        login.assert_async().await;
        assert_eq!(
            session.cookie_value(session.base_url(), "PHPSESSID").as_deref(),
            Some("xyz")
        );
    }

    #[tokio::test]
    async fn json_login_attaches_token_headers() {
        let mut server = Server::new_async().await;
        let _prime = server.mock("GET", "/").with_status(200).create_async().await;
        let _login = server
            .mock("POST", "/login")
            .match_body(Matcher::PartialJson(
                serde_json::json!({"user": "alice", "pass": "s3cret"}),
            ))
            .with_status(200)
            .with_body(r#"{"access_token":"tok","csrf_token":"c1"}"#)
            .create_async()
            .await;
        let search = server
            .mock("GET", "/search")
            .match_header("authorization", "Bearer tok")
            .match_header("x-csrf-token", "c1")
            .with_status(200)
            .create_async()
            .await;
        let site = site_for(
            &server,
            PayloadFormat::Json,
            LoginSuccess::JsonTokens {
                accepted_statuses: vec![200],
                access_token_paths: vec!["access_token".into()],
                csrf_token_path: Some("csrf_token".into()),
            },
        );
        let session = authenticate(&site, &creds()).await.unwrap();
        assert_eq!(session.tokens().csrf.as_deref(), Some("c1"));
        fetcher::fetch(&session, "/search", &[], None).await.unwrap();
        search.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_login_is_auth_error() {
        let mut server = Server::new_async().await;
        let _prime = server.mock("GET", "/").with_status(200).create_async().await;
        let _login = server
            .mock("POST", "/login")
            .with_status(403)
            .create_async()
            .await;
        let site = site_for(&server, PayloadFormat::Form, LoginSuccess::StatusOk);
        let err = authenticate(&site, &creds()).await.unwrap_err();
        assert!(matches!(err, AuthError::Status { status } if status == StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn missing_marker_is_rejected() {
        let mut server = Server::new_async().await;
        let _prime = server.mock("GET", "/").with_status(200).create_async().await;
        let _login = server
            .mock("POST", "/login")
            .with_status(200)
            .with_body("wrong password")
            .create_async()
            .await;
        let site = site_for(
            &server,
            PayloadFormat::Form,
            LoginSuccess::BodyMarker {
                markers: vec!["logout".into()],
            },
        );
        let err = authenticate(&site, &creds()).await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { .. }));
    }

    #[tokio::test]
    async fn custom_verifier_is_used() {
        struct AlwaysReject;
        impl LoginVerifier for AlwaysReject {
            fn verify(&self, _: StatusCode, _: &str) -> Result<SessionTokens, String> {
                Err("nope".into())
            }
        }
        let mut server = Server::new_async().await;
        let _prime = server.mock("GET", "/").with_status(200).create_async().await;
        let _login = server.mock("POST", "/login").with_status(200).create_async().await;
        let site = site_for(&server, PayloadFormat::Form, LoginSuccess::StatusOk);
        let err = authenticate_with(&site, &creds(), &AlwaysReject)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "login rejected: nope");
    }

    #[tokio::test]
    async fn fetch_token_reads_hidden_input() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/msg")
            .with_status(200)
            .with_body(r#"<form><input type="hidden" name="csrf_token" value="tok-1"></form>"#)
            .create_async()
            .await;
        let session = test_session(&server.url());
        let token = fetch_token(&session, "/msg", &TokenPolicy::default())
            .await
            .unwrap();
        assert_eq!(token, "tok-1");
    }

    #[tokio::test]
    async fn fetch_token_reads_cookie() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/msg")
            .with_status(200)
            .with_header("set-cookie", "XSRF-TOKEN=from-cookie; Path=/")
            .with_body("<html></html>")
            .create_async()
            .await;
        let session = test_session(&server.url());
        let policy = TokenPolicy {
            cookie_name: Some("XSRF-TOKEN".into()),
            ..TokenPolicy::default()
        };
        assert_eq!(
            fetch_token(&session, "/msg", &policy).await.unwrap(),
            "from-cookie"
        );
    }

    #[tokio::test]
    async fn fetch_token_gives_up_after_retries() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/msg")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let session = test_session(&server.url());
        let policy = TokenPolicy {
            retries: 3,
            backoff_ms: 1,
            ..TokenPolicy::default()
        };
        let err = fetch_token(&session, "/msg", &policy).await.unwrap_err();
        let TokenError::Exhausted { attempts, .. } = err;
        assert_eq!(attempts, 3);
        m.assert_async().await;
    }
}
