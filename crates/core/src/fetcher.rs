//! HTTP client construction and page fetching.
//!
//! Every request goes through the session's cookie-carrying client. A GET
//! with a non-2xx status becomes a [`FetchError`](crate::error::FetchError);
//! redirects are followed and the final URL is kept on the returned page.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode, Url};

use crate::error::FetchError;
use crate::monitoring;
use crate::session::Session;

/// Client shared by every request of one session. The jar is owned by the session.
pub fn build_http_client(timeout: Duration, jar: Arc<Jar>) -> reqwest::Result<Client> {
    Client::builder()
        .cookie_provider(jar)
        .gzip(true)
        .brotli(true)
        .http2_adaptive_window(true)
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(2)
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
}

/// One fetched page.
#[derive(Debug, Clone)]
pub struct PageContent {
    /// Requested URL including query parameters.
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status: StatusCode,
    pub body: String,
    /// Cookies set by this response.
    pub cookies: Vec<(String, String)>,
}

impl PageContent {
    /// The redirect target when the server answered from a different URL.
    pub fn redirected(&self) -> Option<&str> {
        (self.final_url != self.url).then_some(self.final_url.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) fn resolve(session: &Session, url: &str) -> Result<Url, FetchError> {
    session
        .base_url()
        .join(url)
        .map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

fn send_error(url: &Url, source: reqwest::Error) -> FetchError {
    if source.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            source,
        }
    }
}

/// Invalidate the session on 401 or on a redirect to the login page.
fn check_expiry(
    session: &Session,
    requested: &Url,
    final_url: &Url,
    status: StatusCode,
) -> Result<(), FetchError> {
    let bounced_to_login = session
        .login_path()
        .is_some_and(|p| final_url.path() == p && requested.path() != p);
    if status == StatusCode::UNAUTHORIZED || bounced_to_login {
        tracing::warn!(site = %session.site(), url = %requested, %status, "Session expired");
        session.expire();
        return Err(FetchError::SessionExpired {
            url: requested.to_string(),
        });
    }
    Ok(())
}

/// GET a page. Repeated parameter keys are preserved in order.
///
/// Performs no retries; a non-2xx status is returned as [`FetchError::Status`]
/// and the caller decides whether to skip or abort.
pub async fn fetch(
    session: &Session,
    url: &str,
    params: &[(String, String)],
    extra_headers: Option<HeaderMap>,
) -> Result<PageContent, FetchError> {
    let mut target = resolve(session, url)?;
    if session.is_expired() {
        return Err(FetchError::SessionExpired {
            url: target.to_string(),
        });
    }
    if !params.is_empty() {
        let mut pairs = target.query_pairs_mut();
        for (k, v) in params {
            pairs.append_pair(k, v);
        }
    }

    let mut headers = session.request_headers(Some(session.base_url().as_str()));
    if let Some(extra) = extra_headers {
        headers.extend(extra);
    }

    tracing::debug!(site = %session.site(), url = %target, "GET");
    let resp = session
        .client()
        .get(target.clone())
        .headers(headers)
        .send()
        .await
        .map_err(|e| send_error(&target, e))?;

    let status = resp.status();
    let final_url = resp.url().clone();
    check_expiry(session, &target, &final_url, status)?;
    if !status.is_success() {
        return Err(FetchError::Status {
            status,
            url: target.to_string(),
        });
    }

    let cookies = resp
        .cookies()
        .map(|c| (c.name().to_string(), c.value().to_string()))
        .collect();
    let body = resp.text().await.map_err(|e| send_error(&target, e))?;
    monitoring::record_page_fetched(session.site());

    Ok(PageContent {
        url: target.to_string(),
        final_url: final_url.to_string(),
        status,
        body,
        cookies,
    })
}

/// POST a JSON payload and return the raw status and body.
///
/// Only expiry (401) is mapped to an error; other statuses are for the caller to judge.
pub async fn post_json(
    session: &Session,
    url: &str,
    payload: &serde_json::Value,
    extra_headers: Option<HeaderMap>,
) -> Result<(StatusCode, String), FetchError> {
    let target = resolve(session, url)?;
    if session.is_expired() {
        return Err(FetchError::SessionExpired {
            url: target.to_string(),
        });
    }

    let mut headers = session.request_headers(Some(session.base_url().as_str()));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(extra) = extra_headers {
        headers.extend(extra);
    }

    tracing::debug!(site = %session.site(), url = %target, "POST");
    let resp = session
        .client()
        .post(target.clone())
        .headers(headers)
        .json(payload)
        .send()
        .await
        .map_err(|e| send_error(&target, e))?;
    let status = resp.status();
    let final_url = resp.url().clone();
    check_expiry(session, &target, &final_url, status)?;
    let body = resp.text().await.map_err(|e| send_error(&target, e))?;
    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_session;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn fetch_ok_returns_body() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/ok")
            .with_status(200)
            .with_header("set-cookie", "sid=abc; Path=/")
            .with_body("hello")
            .create_async()
            .await;
        let session = test_session(&server.url());
        let page = fetch(&session, "/ok", &[], None).await.unwrap();
        assert_eq!(page.body, "hello");
        assert_eq!(page.status, StatusCode::OK);
        assert_eq!(page.cookie("sid"), Some("abc"));
        assert!(page.redirected().is_none());
    }

    #[tokio::test]
    async fn repeated_query_keys_are_preserved() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("GET", "/search")
            .match_query(Matcher::Regex(
                "categories%5B%5D=1&categories%5B%5D=2".into(),
            ))
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;
        let session = test_session(&server.url());
        let params = vec![
            ("categories[]".to_string(), "1".to_string()),
            ("categories[]".to_string(), "2".to_string()),
        ];
        fetch(&session, "/search", &params, None).await.unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_fetch_error() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;
        let session = test_session(&server.url());
        let err = fetch(&session, "/missing", &[], None).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert!(!err.is_transient());
        assert!(!session.is_expired());
    }

    #[tokio::test]
    async fn unauthorized_expires_session() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/private")
            .with_status(401)
            .create_async()
            .await;
        let _ok = server
            .mock("GET", "/public")
            .with_status(200)
            .create_async()
            .await;
        let session = test_session(&server.url());
        let err = fetch(&session, "/private", &[], None).await.unwrap_err();
        assert!(matches!(err, FetchError::SessionExpired { .. }));
        let err = fetch(&session, "/public", &[], None).await.unwrap_err();
        assert!(matches!(err, FetchError::SessionExpired { .. }));
    }

    #[tokio::test]
    async fn redirect_to_login_expires_session() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/inbox")
            .with_status(302)
            .with_header("location", "/login")
            .create_async()
            .await;
        let _login = server
            .mock("GET", "/login")
            .with_status(200)
            .with_body("<form></form>")
            .create_async()
            .await;
        let session = test_session(&server.url());
        let err = fetch(&session, "/inbox", &[], None).await.unwrap_err();
        assert!(matches!(err, FetchError::SessionExpired { .. }));
        assert!(session.is_expired());
    }

    #[tokio::test]
    async fn other_redirects_are_reported() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/search")
            .match_query(Matcher::Any)
            .with_status(302)
            .with_header("location", "/fallback")
            .create_async()
            .await;
        let _f = server
            .mock("GET", "/fallback")
            .with_status(200)
            .with_body("fallback")
            .create_async()
            .await;
        let session = test_session(&server.url());
        let params = vec![("q".to_string(), "x".to_string())];
        let page = fetch(&session, "/search", &params, None).await.unwrap();
        assert_eq!(page.redirected(), Some(format!("{}/fallback", server.url()).as_str()));
    }

    #[tokio::test]
    async fn post_json_returns_raw_status() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/submit")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(serde_json::json!({"a": 1})))
            .with_status(400)
            .with_body("duplicate")
            .create_async()
            .await;
        let session = test_session(&server.url());
        let (status, body) = post_json(&session, "/submit", &serde_json::json!({"a": 1}), None)
            .await
            .unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "duplicate");
    }

    #[tokio::test]
    async fn invalid_url_is_reported() {
        let session = test_session("http://127.0.0.1:1");
        let err = fetch(&session, "http://[::1", &[], None).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }
}
