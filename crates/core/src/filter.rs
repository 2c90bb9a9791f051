//! Filter Engine.
//!
//! [`FilterCriteria`] is plain data (read from a request file or built by the
//! CLI). It is validated against the listing schema by [`compile`] before any
//! network I/O, and the compiled form is evaluated per record by [`matches`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FilterError;
use crate::models::{FieldValue, NormalizedRecord};
use crate::query::normalize_keywords;
use crate::schema::{FieldKind, ListingSpec};

/// Keywords as a list or a comma-separated string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum KeywordList {
    Csv(String),
    List(Vec<String>),
}

impl Default for KeywordList {
    fn default() -> Self {
        KeywordList::List(Vec::new())
    }
}

impl KeywordList {
    pub fn normalized(&self) -> Vec<String> {
        match self {
            KeywordList::Csv(s) => normalize_keywords([s]),
            KeywordList::List(items) => normalize_keywords(items),
        }
    }
}

impl From<Vec<String>> for KeywordList {
    fn from(items: Vec<String>) -> Self {
        KeywordList::List(items)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Plain case-insensitive substring.
    #[default]
    Substring,
    /// Keyword must be delimited by word boundaries.
    WordBoundary,
}

/// Inclusive bounds; an absent bound is open.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NumericRange {
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ElapsedUnit {
    #[default]
    Days,
    Hours,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElapsedLimit {
    /// An `elapsed` field, or a `date` field measured against now.
    pub field: String,
    pub amount: i64,
    #[serde(default)]
    pub unit: ElapsedUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateLimit {
    pub field: String,
    /// Records dated before this day are excluded.
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterCriteria {
    #[serde(default)]
    pub positive_keywords: KeywordList,
    #[serde(default)]
    pub negative_keywords: KeywordList,
    #[serde(default)]
    pub match_mode: MatchMode,
    /// Fields whose text is searched; empty means every text field.
    #[serde(default)]
    pub search_fields: Vec<String>,
    #[serde(default)]
    pub numeric_ranges: BTreeMap<String, NumericRange>,
    #[serde(default)]
    pub max_elapsed: Option<ElapsedLimit>,
    #[serde(default)]
    pub min_date: Option<DateLimit>,
    #[serde(default)]
    pub categorical: BTreeMap<String, BTreeSet<String>>,
}

/// Case-insensitive keyword set, OR-ed.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    mode: MatchMode,
    keywords: Vec<String>,
    patterns: Vec<Regex>,
}

impl KeywordMatcher {
    pub fn new(keywords: &[String], mode: MatchMode) -> Result<Self, FilterError> {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        let patterns = match mode {
            MatchMode::Substring => Vec::new(),
            MatchMode::WordBoundary => keywords
                .iter()
                .map(|k| {
                    Regex::new(&format!(r"\b{}\b", regex::escape(k))).map_err(|source| {
                        FilterError::Keyword {
                            keyword: k.clone(),
                            source,
                        }
                    })
                })
                .collect::<Result<_, _>>()?,
        };
        Ok(Self {
            mode,
            keywords,
            patterns,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn matches_any(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        match self.mode {
            MatchMode::Substring => self.keywords.iter().any(|k| text.contains(k.as_str())),
            MatchMode::WordBoundary => self.patterns.iter().any(|p| p.is_match(&text)),
        }
    }
}

/// Validated criteria, ready for per-record evaluation.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    positive: KeywordMatcher,
    negative: KeywordMatcher,
    search_fields: Vec<String>,
    numeric_ranges: Vec<(String, NumericRange)>,
    max_elapsed: Option<(String, ElapsedLimit)>,
    min_date: Option<DateLimit>,
    categorical: Vec<(String, BTreeSet<String>)>,
    now: NaiveDateTime,
}

fn require_kind(
    listing: &ListingSpec,
    field: &str,
    clause: &'static str,
    allowed: &[FieldKind],
    expected: &'static str,
) -> Result<FieldKind, FilterError> {
    let kind = listing
        .kind_of(field)
        .ok_or_else(|| FilterError::UnknownField(field.to_string()))?;
    if !allowed.contains(&kind) {
        return Err(FilterError::FieldKind {
            field: field.to_string(),
            clause,
            expected,
            actual: kind.label(),
        });
    }
    Ok(kind)
}

/// Validate `criteria` against the schema. Runs before any network I/O.
pub fn compile(
    criteria: &FilterCriteria,
    listing: &ListingSpec,
    now: NaiveDateTime,
) -> Result<CompiledFilter, FilterError> {
    for field in &criteria.search_fields {
        require_kind(
            listing,
            field,
            "search_fields",
            &[FieldKind::Text, FieldKind::Link],
            "text",
        )?;
    }
    for (field, range) in &criteria.numeric_ranges {
        require_kind(listing, field, "numeric_ranges", &[FieldKind::Integer], "integer")?;
        if let (Some(min), Some(max)) = (range.min, range.max)
            && min > max
        {
            return Err(FilterError::InvertedRange {
                field: field.clone(),
                min,
                max,
            });
        }
    }
    if let Some(limit) = &criteria.max_elapsed {
        require_kind(
            listing,
            &limit.field,
            "max_elapsed",
            &[FieldKind::Elapsed, FieldKind::Date],
            "elapsed or date",
        )?;
        if limit.amount < 0 {
            return Err(FilterError::NegativeElapsed(limit.field.clone()));
        }
    }
    if let Some(limit) = &criteria.min_date {
        require_kind(listing, &limit.field, "min_date", &[FieldKind::Date], "date")?;
    }
    for (field, allowed) in &criteria.categorical {
        listing
            .kind_of(field)
            .ok_or_else(|| FilterError::UnknownField(field.clone()))?;
        if allowed.is_empty() {
            return Err(FilterError::EmptyCategory(field.clone()));
        }
    }

    let search_fields = if criteria.search_fields.is_empty() {
        listing
            .fields
            .iter()
            .filter(|f| f.kind == FieldKind::Text)
            .map(|f| f.name.clone())
            .collect()
    } else {
        criteria.search_fields.clone()
    };

    Ok(CompiledFilter {
        positive: KeywordMatcher::new(&criteria.positive_keywords.normalized(), criteria.match_mode)?,
        negative: KeywordMatcher::new(&criteria.negative_keywords.normalized(), criteria.match_mode)?,
        search_fields,
        numeric_ranges: criteria
            .numeric_ranges
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect(),
        max_elapsed: criteria
            .max_elapsed
            .clone()
            .map(|l| (l.field.clone(), l)),
        min_date: criteria.min_date.clone(),
        categorical: criteria
            .categorical
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().map(|s| s.to_lowercase()).collect()))
            .collect(),
        now,
    })
}

fn searchable_text(record: &NormalizedRecord, fields: &[String]) -> String {
    fields
        .iter()
        .filter_map(|f| record.text(f))
        .collect::<Vec<_>>()
        .join(" ")
}

fn within_elapsed(value: Option<&FieldValue>, limit: &ElapsedLimit, now: NaiveDateTime) -> bool {
    let elapsed: TimeDelta = match value {
        Some(FieldValue::Elapsed(Some(d))) => *d,
        Some(FieldValue::Date(Some(date))) => now - *date,
        // Unknown age and null dates never satisfy a bound.
        _ => return false,
    };
    match limit.unit {
        ElapsedUnit::Days => elapsed.num_days() <= limit.amount,
        ElapsedUnit::Hours => TimeDelta::try_hours(limit.amount).is_some_and(|b| elapsed <= b),
    }
}

/// Evaluate every clause, short-circuiting in a fixed order.
pub fn matches(record: &NormalizedRecord, filter: &CompiledFilter) -> bool {
    if !filter.positive.is_empty() || !filter.negative.is_empty() {
        let text = searchable_text(record, &filter.search_fields);
        if !filter.positive.is_empty() && !filter.positive.matches_any(&text) {
            return false;
        }
        if !filter.negative.is_empty() && filter.negative.matches_any(&text) {
            return false;
        }
    }

    for (field, range) in &filter.numeric_ranges {
        let Some(n) = record.get(field).and_then(FieldValue::as_integer) else {
            return false;
        };
        if range.min.is_some_and(|min| n < min) || range.max.is_some_and(|max| n > max) {
            return false;
        }
    }

    if let Some((field, limit)) = &filter.max_elapsed
        && !within_elapsed(record.get(field), limit, filter.now)
    {
        return false;
    }

    for (field, allowed) in &filter.categorical {
        let value = record
            .get(field)
            .map(|v| v.display().to_lowercase())
            .unwrap_or_default();
        if !allowed.contains(&value) {
            return false;
        }
    }

    if let Some(limit) = &filter.min_date {
        match record.get(&limit.field) {
            Some(FieldValue::Date(Some(d))) if d.date() >= limit.date => {}
            _ => return false,
        }
    }

    true
}
