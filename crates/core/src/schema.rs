//! Declarative field schema.
//!
//! A listing is described by a container selector plus one [`FieldRule`] per
//! logical field. Rules are data (usually read from `sites.toml`) and are
//! compiled once per run into [`CompiledListing`].

use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Sentinel for absent text fields.
pub const UNAVAILABLE: &str = "unavailable";

/// Default pattern for absolute dates on German-language portals.
pub const DEFAULT_DATE_FORMAT: &str = "%d.%m.%Y";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Date,
    /// "online since 2 Tage" style text, normalized to a duration.
    Elapsed,
    Boolean,
    /// Attribute holding a URL, resolved against the site base URL.
    Link,
}

impl FieldKind {
    pub fn label(self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Date => "date",
            FieldKind::Elapsed => "elapsed",
            FieldKind::Boolean => "boolean",
            FieldKind::Link => "link",
        }
    }

    pub fn is_textual(self) -> bool {
        matches!(self, FieldKind::Text | FieldKind::Link)
    }
}

/// What an `elapsed` field holds when its element is absent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ElapsedOnMissing {
    /// Unknown age; fails any `max_elapsed` bound.
    #[default]
    Unbounded,
    /// Assume the listing is recent.
    Zero,
}

/// Positional sub-extraction from a delimited composite string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    pub index: usize,
}

fn default_delimiter() -> String {
    "|".to_string()
}

/// Field only available on a per-record detail page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetailSpec {
    /// Record field holding the detail page URL.
    pub link_field: String,
    /// Element on the detail page; `None` takes the whole page text.
    #[serde(default)]
    pub selector: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldRule {
    pub name: String,
    pub kind: FieldKind,
    /// Element inside the container; `None` means the container itself.
    #[serde(default)]
    pub selector: Option<String>,
    /// Attribute to read instead of the element text.
    #[serde(default)]
    pub attr: Option<String>,
    /// Regex applied to the extracted text; first capture group wins.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub segment: Option<Segment>,
    /// chrono format for `date` fields and absolute dates in `elapsed` text.
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub on_missing: ElapsedOnMissing,
    #[serde(default)]
    pub detail: Option<DetailSpec>,
}

impl FieldRule {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            selector: None,
            attr: None,
            pattern: None,
            segment: None,
            date_format: None,
            fallback: None,
            required: false,
            on_missing: ElapsedOnMissing::default(),
            detail: None,
        }
    }

    pub fn selector(mut self, selector: &str) -> Self {
        self.selector = Some(selector.to_string());
        self
    }

    pub fn attr(mut self, attr: &str) -> Self {
        self.attr = Some(attr.to_string());
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self
    }

    pub fn segment(mut self, delimiter: &str, index: usize) -> Self {
        self.segment = Some(Segment {
            delimiter: delimiter.to_string(),
            index,
        });
        self
    }

    pub fn date_format(mut self, format: &str) -> Self {
        self.date_format = Some(format.to_string());
        self
    }

    pub fn fallback(mut self, fallback: &str) -> Self {
        self.fallback = Some(fallback.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn on_missing(mut self, policy: ElapsedOnMissing) -> Self {
        self.on_missing = policy;
        self
    }

    pub fn detail(mut self, link_field: &str, selector: Option<&str>) -> Self {
        self.detail = Some(DetailSpec {
            link_field: link_field.to_string(),
            selector: selector.map(str::to_string),
        });
        self
    }

    pub fn fallback_text(&self) -> &str {
        self.fallback.as_deref().unwrap_or(UNAVAILABLE)
    }

    pub fn date_format_or_default(&self) -> &str {
        self.date_format.as_deref().unwrap_or(DEFAULT_DATE_FORMAT)
    }
}

/// Integer field holding the day count between two date fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpanRule {
    pub name: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingSpec {
    pub container: String,
    /// Containers holding a match for this selector are skipped.
    #[serde(default)]
    pub exclude: Option<String>,
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub spans: Vec<SpanRule>,
}

impl ListingSpec {
    pub fn field(&self, name: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Logical kind of every declared field, spans included.
    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.field(name).map(|f| f.kind).or_else(|| {
            self.spans
                .iter()
                .any(|s| s.name == name)
                .then_some(FieldKind::Integer)
        })
    }

    pub fn has_detail_fields(&self) -> bool {
        self.fields.iter().any(|f| f.detail.is_some())
    }

    pub fn compile(&self) -> Result<CompiledListing, ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for name in self
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.spans.iter().map(|s| s.name.as_str()))
        {
            if !seen.insert(name) {
                return Err(ConfigError::Invalid {
                    site: String::new(),
                    reason: format!("duplicate field '{name}'"),
                });
            }
        }
        for detail in self.fields.iter().filter_map(|f| f.detail.as_ref()) {
            if self.field(&detail.link_field).is_none() {
                return Err(ConfigError::Invalid {
                    site: String::new(),
                    reason: format!("detail link field '{}' is not declared", detail.link_field),
                });
            }
        }
        for span in &self.spans {
            for end in [&span.start, &span.end] {
                if self.field(end).map(|f| f.kind) != Some(FieldKind::Date) {
                    return Err(ConfigError::Invalid {
                        site: String::new(),
                        reason: format!("span '{}' needs date field '{end}'", span.name),
                    });
                }
            }
        }

        let rules = self
            .fields
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledListing {
            container: parse_selector(&self.container)?,
            exclude: self.exclude.as_deref().map(parse_selector).transpose()?,
            rules,
            spans: self.spans.clone(),
        })
    }
}

#[derive(Debug)]
pub struct CompiledRule {
    pub rule: FieldRule,
    pub selector: Option<Selector>,
    pub pattern: Option<Regex>,
    pub detail_selector: Option<Selector>,
}

impl CompiledRule {
    fn compile(rule: &FieldRule) -> Result<Self, ConfigError> {
        let pattern = rule
            .pattern
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::Pattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .transpose()?;
        let detail_selector = rule
            .detail
            .as_ref()
            .and_then(|d| d.selector.as_deref())
            .map(parse_selector)
            .transpose()?;
        Ok(Self {
            selector: rule.selector.as_deref().map(parse_selector).transpose()?,
            pattern,
            detail_selector,
            rule: rule.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.rule.name
    }

    pub fn is_detail(&self) -> bool {
        self.rule.detail.is_some()
    }
}

#[derive(Debug)]
pub struct CompiledListing {
    pub container: Selector,
    pub exclude: Option<Selector>,
    pub rules: Vec<CompiledRule>,
    pub spans: Vec<SpanRule>,
}

impl CompiledListing {
    pub fn detail_rules(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter().filter(|r| r.is_detail())
    }
}

pub fn parse_selector(selector: &str) -> Result<Selector, ConfigError> {
    Selector::parse(selector).map_err(|e| ConfigError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> ListingSpec {
        ListingSpec {
            container: "div.item".into(),
            exclude: None,
            fields: vec![
                FieldRule::new("title", FieldKind::Text).selector("h3"),
                FieldRule::new("link", FieldKind::Link).selector("h3 a").attr("href"),
                FieldRule::new("from", FieldKind::Date).selector(".dates").segment(" - ", 0),
                FieldRule::new("to", FieldKind::Date).selector(".dates").segment(" - ", 1),
                FieldRule::new("body", FieldKind::Text).detail("link", Some("#body")),
            ],
            spans: vec![SpanRule {
                name: "stay".into(),
                start: "from".into(),
                end: "to".into(),
            }],
        }
    }

    #[test]
    fn compiles_valid_listing() {
        let compiled = listing().compile().unwrap();
        assert_eq!(compiled.rules.len(), 5);
        assert_eq!(compiled.detail_rules().count(), 1);
        assert_eq!(listing().kind_of("stay"), Some(FieldKind::Integer));
    }

    #[test]
    fn rejects_bad_selector() {
        let mut spec = listing();
        spec.container = "div[".into();
        assert!(matches!(spec.compile(), Err(ConfigError::Selector { .. })));
    }

    #[test]
    fn rejects_duplicate_fields() {
        let mut spec = listing();
        spec.fields.push(FieldRule::new("title", FieldKind::Text));
        assert!(matches!(spec.compile(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rejects_undeclared_detail_link() {
        let mut spec = listing();
        spec.fields[4] = FieldRule::new("body", FieldKind::Text).detail("href", None);
        assert!(spec.compile().is_err());
    }

    #[test]
    fn rejects_bad_pattern() {
        let mut spec = listing();
        spec.fields[0] = FieldRule::new("title", FieldKind::Text).pattern("(");
        assert!(matches!(spec.compile(), Err(ConfigError::Pattern { .. })));
    }

    #[test]
    fn fallback_defaults_to_sentinel() {
        let rule = FieldRule::new("x", FieldKind::Text);
        assert_eq!(rule.fallback_text(), UNAVAILABLE);
        assert_eq!(rule.fallback("No title").fallback_text(), "No title");
    }
}
