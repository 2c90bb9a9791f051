use chrono::{NaiveDateTime, TimeDelta};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::filter::FilterCriteria;

/// Login identifier and secret. Supplied by the caller, never logged.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub identifier: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Typed value of one record field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    /// `None` is the null-date of an unparseable date.
    Date(Option<NaiveDateTime>),
    /// `None` is an unknown age that fails every elapsed bound.
    Elapsed(Option<TimeDelta>),
    Boolean(bool),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Plain string form used for categorical comparison and table output.
    pub fn display(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(n) => n.to_string(),
            FieldValue::Date(Some(d)) => d.format("%Y-%m-%d %H:%M").to_string(),
            FieldValue::Date(None) => String::new(),
            FieldValue::Elapsed(Some(d)) => format!("{}h", d.num_hours()),
            FieldValue::Elapsed(None) => String::new(),
            FieldValue::Boolean(b) => b.to_string(),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Integer(n) => serializer.serialize_i64(*n),
            FieldValue::Date(Some(d)) => {
                serializer.serialize_str(&d.format("%Y-%m-%dT%H:%M:%S").to_string())
            }
            FieldValue::Date(None) | FieldValue::Elapsed(None) => serializer.serialize_none(),
            // Elapsed values are reported in hours.
            FieldValue::Elapsed(Some(d)) => {
                serializer.serialize_f64(d.num_seconds() as f64 / 3600.0)
            }
            FieldValue::Boolean(b) => serializer.serialize_bool(*b),
        }
    }
}

/// One listing, with every schema field present in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecord {
    fields: Vec<(String, FieldValue)>,
}

impl NormalizedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field, keeping its original position.
    pub fn set(&mut self, name: &str, value: FieldValue) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for NormalizedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// One orchestration request. Credentials travel separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Extra search parameters appended after the configured ones.
    #[serde(default)]
    pub params: Vec<(String, String)>,
    #[serde(default)]
    pub criteria: FilterCriteria,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Structured result of a run; the orchestrator never returns `Err`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RunOutcome {
    Success {
        #[serde(rename = "resultRecords")]
        result_records: Vec<NormalizedRecord>,
    },
    Failure {
        error: String,
        stage: crate::orchestrator::RunState,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        match self {
            RunOutcome::Success { result_records } => result_records,
            RunOutcome::Failure { .. } => &[],
        }
    }
}
