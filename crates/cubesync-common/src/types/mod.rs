//! Common types used across cube-sync
//!
//! Rows are what the cube parser produces, records are what the upsert
//! engine consumes. Neither is persisted locally.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;

use crate::error::CubeSyncError;

// ============================================================================
// Cell values and rows
// ============================================================================

/// A single value read from a cube response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    #[default]
    Null,
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        CellValue::Text(value.into())
    }

    /// Interpret the text content of a `<Value>` element.
    ///
    /// Anything that parses as a float becomes a number, everything else is
    /// kept verbatim so the transformer can decide how to coerce it.
    pub fn from_cell_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return CellValue::Null;
        }
        match trimmed.parse::<f64>() {
            Ok(n) => CellValue::Number(n),
            Err(_) => CellValue::Text(raw.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Textual form of the value, `None` for null.
    ///
    /// Integral numbers render without a fractional part (`125`, not `125.0`).
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            CellValue::Null => None,
            CellValue::Text(s) => Some(Cow::Borrowed(s.as_str())),
            CellValue::Number(n) => Some(Cow::Owned(format_number(*n))),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// One flattened row of a cube cell set.
///
/// Keeps insertion order: dimension fields in row-axis order, then measures
/// in column-axis order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Row {
    entries: Vec<(String, CellValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert or replace a value. Replacing keeps the original position.
    pub fn insert(&mut self, field: impl Into<String>, value: CellValue) {
        let field = field.into();
        match self.entries.iter_mut().find(|(name, _)| *name == field) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((field, value)),
        }
    }

    pub fn get(&self, field: &str) -> Option<&CellValue> {
        self.entries
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, CellValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, CellValue)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (field, value) in iter {
            row.insert(field, value);
        }
        row
    }
}

// ============================================================================
// Field types
// ============================================================================

/// Semantic type a source column is coerced to before it is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Date,
    Int,
    Decimal,
}

impl std::str::FromStr for FieldType {
    type Err = CubeSyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" | "text" => Ok(FieldType::String),
            "date" => Ok(FieldType::Date),
            "int" | "integer" => Ok(FieldType::Int),
            "decimal" | "float" | "number" => Ok(FieldType::Decimal),
            _ => Err(CubeSyncError::parse(format!("Unsupported field type: {}", s))),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Date => write!(f, "date"),
            FieldType::Int => write!(f, "int"),
            FieldType::Decimal => write!(f, "decimal"),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A persistence-ready record addressed by its business key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Alternate key column, e.g. `crf63_businesskey`
    pub key_field: String,
    /// Canonical composite key value
    pub business_key: String,
    /// Target column -> coerced value. Never holds nulls.
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(key_field: impl Into<String>, business_key: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            business_key: business_key.into(),
            fields: Map::new(),
        }
    }

    /// Set a column. Nulls are dropped so they never clobber existing values.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        if !value.is_null() {
            self.fields.insert(column.into(), value);
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn has_key(&self) -> bool {
        !self.business_key.trim().is_empty()
    }

    /// JSON body for the record's upsert: every non-null column plus the key.
    pub fn payload(&self) -> Value {
        let mut body: Map<String, Value> = self
            .fields
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        body.insert(
            self.key_field.clone(),
            Value::String(self.business_key.clone()),
        );
        Value::Object(body)
    }
}
