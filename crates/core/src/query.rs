//! Search request construction: normalized parameters and paginated page URLs.

use crate::config::SearchSpec;

pub fn normalize_query(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split comma-separated entries, trim, lowercase and drop empties and duplicates.
pub fn normalize_keywords<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for item in items {
        for part in item.as_ref().split(',') {
            let kw = normalize_query(part).to_lowercase();
            if !kw.is_empty() && !out.contains(&kw) {
                out.push(kw);
            }
        }
    }
    out
}

/// One search page to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    pub params: Vec<(String, String)>,
    pub page: u32,
}

impl PageRequest {
    /// URL with the encoded query, for logs.
    pub fn display_url(&self) -> String {
        match serde_urlencoded::to_string(&self.params) {
            Ok(qs) if !qs.is_empty() => format!("{}?{}", self.url, qs),
            _ => self.url.clone(),
        }
    }
}

/// Merge configured and caller parameters.
///
/// A caller key replaces every configured pair with that key; repeated caller
/// keys are all kept.
pub fn merge_params(
    configured: &[(String, String)],
    overrides: &[(String, String)],
) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = configured
        .iter()
        .filter(|(k, _)| !overrides.iter().any(|(o, _)| o == k))
        .cloned()
        .collect();
    params.extend(overrides.iter().cloned());
    params
}

/// Page requests for one run, in fetch order.
pub fn build_page_requests(
    search: &SearchSpec,
    overrides: &[(String, String)],
    csrf: Option<&str>,
) -> Vec<PageRequest> {
    let mut base = merge_params(&search.params, overrides);
    if let (Some(param), Some(token)) = (search.csrf_param.as_deref(), csrf) {
        base.push((param.to_string(), token.to_string()));
    }
    match search.page_param.as_deref() {
        None => vec![PageRequest {
            url: search.url.clone(),
            params: base,
            page: 1,
        }],
        Some(param) => (1..=search.max_pages.max(1))
            .map(|page| {
                let mut params = base.clone();
                params.push((param.to_string(), page.to_string()));
                PageRequest {
                    url: search.url.clone(),
                    params,
                    page,
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn p(k: &str, v: &str) -> (String, String) {
        (k.to_string(), v.to_string())
    }

    fn spec() -> SearchSpec {
        SearchSpec {
            url: "/search".into(),
            params: vec![p("categories[]", "1"), p("categories[]", "2"), p("rMax", "1000")],
            page_param: None,
            max_pages: 1,
            csrf_param: None,
            refetch_on_redirect: false,
        }
    }

    #[test]
    fn normalize_collapses_spaces() {
        assert_eq!(normalize_query("  hello   world  "), "hello world");
        assert_eq!(normalize_query("\t\t"), "");
    }

    #[test]
    fn keywords_split_trim_lowercase() {
        assert_eq!(
            normalize_keywords(["Terraform, AWS ,,aws", " Kubernetes "]),
            vec!["terraform", "aws", "kubernetes"]
        );
        assert!(normalize_keywords(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn overrides_replace_configured_keys() {
        let merged = merge_params(&spec().params, &[p("rMax", "800"), p("fur", "1")]);
        assert_eq!(
            merged,
            vec![
                p("categories[]", "1"),
                p("categories[]", "2"),
                p("rMax", "800"),
                p("fur", "1")
            ]
        );
    }

    #[test]
    fn single_page_without_page_param() {
        let mut search = spec();
        search.max_pages = 5;
        let pages = build_page_requests(&search, &[], None);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page, 1);
    }

    #[test]
    fn paginates_and_appends_csrf() {
        let mut search = spec();
        search.page_param = Some("page".into());
        search.max_pages = 3;
        search.csrf_param = Some("csrf_token".into());
        let pages = build_page_requests(&search, &[], Some("tok"));
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].params.last(), Some(&p("page", "3")));
        assert!(pages[0].params.contains(&p("csrf_token", "tok")));
    }

    #[test]
    fn display_url_encodes_params() {
        let page = build_page_requests(&spec(), &[], None).remove(0);
        assert_eq!(
            page.display_url(),
            "/search?categories%5B%5D=1&categories%5B%5D=2&rMax=1000"
        );
    }
}
