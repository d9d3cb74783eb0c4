//! Key templates
//!
//! Business keys and display names are written as format strings over source
//! field names, e.g. `{StoreNumber}_{CalendarDate:%Y%m%d}`. A `:spec` suffix
//! is a strftime pattern and is only allowed on date fields. `{{` and `}}`
//! produce literal braces.

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::fmt::Write;

use super::coerce::Coerced;
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { name: String, spec: Option<String> },
}

/// Parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                },
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                },
                '{' => {
                    let mut body = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    if !closed {
                        return Err(IngestError::config(format!(
                            "Unclosed '{{' in template '{}'",
                            source
                        )));
                    }
                    let (name, spec) = match body.split_once(':') {
                        Some((name, spec)) => (name.trim(), Some(spec.to_string())),
                        None => (body.trim(), None),
                    };
                    if name.is_empty() {
                        return Err(IngestError::config(format!(
                            "Empty placeholder in template '{}'",
                            source
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field {
                        name: name.to_string(),
                        spec,
                    });
                },
                '}' => {
                    return Err(IngestError::config(format!(
                        "Single '}}' in template '{}'",
                        source
                    )));
                },
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Placeholders in order of appearance, with their format spec.
    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Field { name, spec } => Some((name.as_str(), spec.as_deref())),
            Segment::Literal(_) => None,
        })
    }

    /// Render against coerced values.
    ///
    /// Fails with `MissingKeyField` naming the first placeholder that has
    /// no value.
    pub fn render(&self, values: &HashMap<&str, Coerced>) -> Result<String> {
        let mut out = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { name, spec } => {
                    let value = values
                        .get(name.as_str())
                        .ok_or_else(|| IngestError::missing_key_field(name.clone()))?;
                    match (value, spec) {
                        (Coerced::Date(date), Some(spec)) => write_date(&mut out, *date, spec)?,
                        (Coerced::Date(date), None) => write_date(&mut out, *date, "%Y-%m-%d")?,
                        (other, _) => out.push_str(&other.to_key_text()),
                    }
                },
            }
        }

        Ok(out)
    }
}

fn write_date(out: &mut String, date: NaiveDate, spec: &str) -> Result<()> {
    write!(out, "{}", date.format(spec))
        .map_err(|_| IngestError::config(format!("Invalid date format '{}'", spec)))
}

/// Reject strftime patterns chrono cannot render.
pub fn validate_strftime(spec: &str) -> Result<()> {
    if StrftimeItems::new(spec).any(|item| matches!(item, Item::Error)) {
        return Err(IngestError::config(format!(
            "Invalid date format '{}'",
            spec
        )));
    }
    Ok(())
}
