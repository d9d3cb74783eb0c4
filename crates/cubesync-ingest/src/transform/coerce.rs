//! Cell value coercion
//!
//! Every failure here is a null, never an error. A corrupt cell loses its
//! field, the row survives.

use chrono::NaiveDate;
use cubesync_common::types::{CellValue, FieldType};
use serde_json::Value;

/// A value after coercion to its declared type
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Text(String),
    Date(NaiveDate),
    Int(i64),
    Decimal(f64),
}

impl Coerced {
    pub fn to_json(&self) -> Value {
        match self {
            Coerced::Text(s) => Value::String(s.clone()),
            Coerced::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            Coerced::Int(i) => Value::from(*i),
            Coerced::Decimal(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }

    pub(crate) fn to_key_text(&self) -> String {
        match self {
            Coerced::Text(s) => s.clone(),
            Coerced::Date(d) => d.format("%Y-%m-%d").to_string(),
            Coerced::Int(i) => i.to_string(),
            Coerced::Decimal(f) => f.to_string(),
        }
    }
}

/// Coerce a cell to `ty`. `None` means null.
pub fn coerce(value: &CellValue, ty: FieldType) -> Option<Coerced> {
    match ty {
        FieldType::String => value.as_text().map(|s| Coerced::Text(s.into_owned())),
        FieldType::Date => match value {
            CellValue::Text(s) => parse_date(s).map(Coerced::Date),
            _ => None,
        },
        FieldType::Int => to_float(value)
            .filter(|f| f.abs() < i64::MAX as f64)
            .map(|f| Coerced::Int(f.trunc() as i64)),
        FieldType::Decimal => to_float(value).map(Coerced::Decimal),
    }
}

fn to_float(value: &CellValue) -> Option<f64> {
    let parsed = match value {
        CellValue::Null => return None,
        CellValue::Number(n) => *n,
        CellValue::Text(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',').collect();
            cleaned.trim().parse::<f64>().ok()?
        },
    };
    parsed.is_finite().then_some(parsed)
}

const NAMED_MONTH_FORMATS: &[&str] = &[
    "%B %d, %Y",
    "%b %d, %Y",
    "%A, %B %d, %Y",
    "%a, %b %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%d-%b-%Y",
    "%d-%b-%y",
];

/// Parse a cube date caption into a calendar date.
///
/// Slash dates are month-first (`11/5/25`, `11/05/2025`) unless the first
/// part cannot be a month. Two-digit years 00-68 map to 20xx. Any time of
/// day or UTC offset is discarded without conversion.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    for format in NAMED_MONTH_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }

    let date_part = text
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or(text);

    parse_numeric_date(date_part)
}

fn parse_numeric_date(s: &str) -> Option<NaiveDate> {
    if s.len() == 8 && s.chars().all(|c| c.is_ascii_digit()) {
        return NaiveDate::parse_from_str(s, "%Y%m%d").ok();
    }

    let separator = if s.contains('/') {
        '/'
    } else if s.contains('-') {
        '-'
    } else if s.contains('.') {
        '.'
    } else {
        return None;
    };

    let parts: Vec<&str> = s.split(separator).collect();
    if parts.len() != 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }
    let nums: Vec<u32> = parts.iter().filter_map(|p| p.parse().ok()).collect();
    if nums.len() != 3 {
        return None;
    }

    if parts[0].len() == 4 {
        return NaiveDate::from_ymd_opt(nums[0] as i32, nums[1], nums[2]);
    }

    let year = expand_year(parts[2], nums[2])?;
    let (month, day) = if nums[0] > 12 && nums[1] <= 12 {
        (nums[1], nums[0])
    } else {
        (nums[0], nums[1])
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

fn expand_year(raw: &str, value: u32) -> Option<i32> {
    match raw.len() {
        1 | 2 if value < 69 => Some(2000 + value as i32),
        1 | 2 => Some(1900 + value as i32),
        4 => Some(value as i32),
        _ => None,
    }
}
