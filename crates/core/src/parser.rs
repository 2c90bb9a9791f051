//! Record Parser.
//!
//! One generic extraction routine evaluates a [`CompiledListing`] against each
//! container element of a page. Missing sub-elements yield the rule's fallback;
//! only a missing `required` field drops a record.

use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html};

use crate::error::ParseError;
use crate::models::{FieldValue, NormalizedRecord};
use crate::monitoring;
use crate::query::normalize_query;
use crate::schema::{
    CompiledListing, CompiledRule, DEFAULT_DATE_FORMAT, ElapsedOnMissing, FieldKind, SpanRule,
};

static ABSOLUTE_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{2}\.\d{2}\.\d{4}").unwrap());
static RELATIVE_AGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|\s)(\d+)?\s*(tage?n?|days?|stunden?|hours?|minuten?|minutes?)\b").unwrap()
});

/// Inputs shared by every record of a run.
#[derive(Debug, Clone)]
pub struct ParseContext {
    /// Relative links are resolved against this.
    pub base_url: Url,
    /// Reference point for elapsed-time text.
    pub now: NaiveDateTime,
}

impl ParseContext {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            now: chrono::Local::now().naive_local(),
        }
    }
}

/// Lazily yield one record per non-excluded container, in document order.
pub fn parse_records<'a>(
    doc: &'a Html,
    listing: &'a CompiledListing,
    ctx: &'a ParseContext,
) -> impl Iterator<Item = NormalizedRecord> + 'a {
    doc.select(&listing.container)
        .filter(move |container| match &listing.exclude {
            Some(ex) if container.select(ex).next().is_some() => {
                tracing::debug!("Skipping excluded listing");
                false
            }
            _ => true,
        })
        .filter_map(move |container| match build_record(container, listing, ctx) {
            Ok(record) => {
                monitoring::record_parsed();
                Some(record)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed record");
                monitoring::record_dropped();
                None
            }
        })
}

/// Parse a whole page body. `Html` is not `Send`, so callers in async code
/// use this to keep the document off the await points.
pub fn parse_page(body: &str, listing: &CompiledListing, ctx: &ParseContext) -> Vec<NormalizedRecord> {
    let doc = Html::parse_document(body);
    parse_records(&doc, listing, ctx).collect()
}

fn build_record(
    container: ElementRef<'_>,
    listing: &CompiledListing,
    ctx: &ParseContext,
) -> Result<NormalizedRecord, ParseError> {
    let mut record = NormalizedRecord::new();
    for rule in &listing.rules {
        let value = if rule.is_detail() {
            fallback_value(rule)
        } else {
            extract(container, rule, ctx)?
        };
        record.set(rule.name(), value);
    }
    for span in &listing.spans {
        let days = span_days(&record, span);
        record.set(&span.name, FieldValue::Integer(days));
    }
    Ok(record)
}

/// Value used when an element, attribute, pattern match or segment is absent.
pub fn fallback_value(rule: &CompiledRule) -> FieldValue {
    let r = &rule.rule;
    match r.kind {
        FieldKind::Text | FieldKind::Link => FieldValue::Text(r.fallback_text().to_string()),
        FieldKind::Integer => FieldValue::Integer(
            r.fallback
                .as_deref()
                .and_then(|f| f.trim().parse().ok())
                .unwrap_or(0),
        ),
        FieldKind::Date => FieldValue::Date(
            r.fallback
                .as_deref()
                .and_then(|f| parse_date(f, r.date_format_or_default())),
        ),
        FieldKind::Elapsed => match r.on_missing {
            ElapsedOnMissing::Unbounded => FieldValue::Elapsed(None),
            ElapsedOnMissing::Zero => FieldValue::Elapsed(Some(TimeDelta::zero())),
        },
        FieldKind::Boolean => FieldValue::Boolean(false),
    }
}

/// Text of an element with whitespace collapsed.
pub fn element_text(el: ElementRef<'_>) -> String {
    normalize_query(&el.text().collect::<Vec<_>>().join(" "))
}

fn missing(rule: &CompiledRule) -> Result<FieldValue, ParseError> {
    if rule.rule.required {
        Err(ParseError::MissingRequired {
            field: rule.name().to_string(),
        })
    } else {
        Ok(fallback_value(rule))
    }
}

fn extract(
    container: ElementRef<'_>,
    rule: &CompiledRule,
    ctx: &ParseContext,
) -> Result<FieldValue, ParseError> {
    let target = match &rule.selector {
        Some(sel) => container.select(sel).next(),
        None => Some(container),
    };
    let Some(el) = target else {
        return missing(rule);
    };

    if rule.rule.kind == FieldKind::Boolean {
        let present = match &rule.pattern {
            Some(re) => re.is_match(&element_text(el)),
            None => true,
        };
        return Ok(FieldValue::Boolean(present));
    }

    let raw = match rule.rule.attr.as_deref() {
        Some(attr) => match el.value().attr(attr) {
            Some(v) => v.trim().to_string(),
            None => return missing(rule),
        },
        None => element_text(el),
    };

    let captured = match &rule.pattern {
        Some(re) => match re.captures(&raw) {
            Some(caps) => caps
                .get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            None => return missing(rule),
        },
        None => raw,
    };

    let text = match &rule.rule.segment {
        Some(seg) => match split_segment(&captured, &seg.delimiter, seg.index) {
            Some(s) => s,
            None => return missing(rule),
        },
        None => captured,
    };

    Ok(coerce(rule, &text, ctx))
}

/// Positional segment after trimming and dropping empty segments.
pub fn split_segment(text: &str, delimiter: &str, index: usize) -> Option<String> {
    text.split(delimiter)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .nth(index)
        .map(str::to_string)
}

fn coerce(rule: &CompiledRule, text: &str, ctx: &ParseContext) -> FieldValue {
    let r = &rule.rule;
    match r.kind {
        FieldKind::Text => FieldValue::Text(text.to_string()),
        FieldKind::Link => match ctx.base_url.join(text) {
            Ok(url) if !text.is_empty() => FieldValue::Text(url.to_string()),
            _ => fallback_value(rule),
        },
        FieldKind::Integer => FieldValue::Integer(parse_integer(text)),
        FieldKind::Date => FieldValue::Date(parse_date(text, r.date_format_or_default())),
        FieldKind::Elapsed => FieldValue::Elapsed(Some(parse_elapsed(
            text,
            ctx.now,
            r.date_format_or_default(),
        ))),
        FieldKind::Boolean => FieldValue::Boolean(true),
    }
}

/// Strip every non-digit, then parse. Empty or overflowing input is 0.
pub fn parse_integer(text: &str) -> i64 {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Parse a date or date-time; date-only input is taken at midnight.
pub fn parse_date(text: &str, format: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, format)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, format)
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// First date in `text` readable with `format`, scanning from each token start.
fn find_date(text: &str, format: &str) -> Option<NaiveDateTime> {
    let starts = text
        .char_indices()
        .filter(|&(i, c)| !c.is_whitespace() && (i == 0 || text[..i].ends_with(char::is_whitespace)))
        .map(|(i, _)| i);
    for start in starts {
        let rest = &text[start..];
        if let Ok((dt, _)) = NaiveDateTime::parse_and_remainder(rest, format) {
            return Some(dt);
        }
        if let Ok((d, _)) = NaiveDate::parse_and_remainder(rest, format) {
            return Some(d.and_time(NaiveTime::MIN));
        }
    }
    None
}

/// Age of a listing from text such as "2 Tage", "3 Stunden" or "online seit 01.03.2024".
///
/// An absolute date (read with `format`, then `DD.MM.YYYY`) gives `now - date`.
/// A unit directly after a number takes that number, a bare unit counts 1.
/// Anything else is zero.
pub fn parse_elapsed(text: &str, now: NaiveDateTime, format: &str) -> TimeDelta {
    let text = text.trim();
    let date = parse_date(text, format)
        .or_else(|| find_date(text, format))
        .or_else(|| {
            ABSOLUTE_DATE
                .find(text)
                .and_then(|m| parse_date(m.as_str(), DEFAULT_DATE_FORMAT))
        });
    if let Some(date) = date {
        return now - date;
    }
    let Some(caps) = RELATIVE_AGE.captures(text) else {
        tracing::debug!(text, "Unrecognized elapsed text, assuming recent");
        return TimeDelta::zero();
    };
    let count = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .unwrap_or(1);
    let unit = caps[2].to_lowercase();
    let delta = if unit.starts_with("tag") || unit.starts_with("day") {
        TimeDelta::try_days(count)
    } else if unit.starts_with("stunde") || unit.starts_with("hour") {
        TimeDelta::try_hours(count)
    } else {
        TimeDelta::try_minutes(count)
    };
    delta.unwrap_or_else(TimeDelta::zero)
}

fn span_days(record: &NormalizedRecord, span: &SpanRule) -> i64 {
    match (record.get(&span.start), record.get(&span.end)) {
        (Some(FieldValue::Date(Some(start))), Some(FieldValue::Date(Some(end)))) => {
            (*end - *start).num_days()
        }
        _ => 0,
    }
}
