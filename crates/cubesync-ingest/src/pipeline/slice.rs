//! Refresh slices
//!
//! A historical reload is too large for one cube query, so `refresh` can run
//! the pipeline once per slice: per fiscal year (the MDX slicer is replaced)
//! or per value of one template variable.

use std::collections::HashMap;
use std::fmt;

use super::definition::PipelineDefinition;

/// Calendar level the fiscal-year slicer addresses
pub const FISCAL_YEAR_LEVEL: &str = "[Calendar].[Calendar Hierarchy].[Fiscal_Year]";

fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn keyword_at(bytes: &[u8], at: usize, keyword: &[u8]) -> bool {
    let end = at + keyword.len();
    end <= bytes.len()
        && bytes[at..end].eq_ignore_ascii_case(keyword)
        && (at == 0 || !is_identifier_byte(bytes[at - 1]))
        && bytes.get(end).map_or(true, |b| !is_identifier_byte(*b))
}

/// Byte offset of the last `WHERE` keyword outside `[...]` identifiers.
fn last_where(mdx: &str) -> Option<usize> {
    let bytes = mdx.as_bytes();
    let mut depth = 0usize;
    let mut found = None;

    for (at, &b) in bytes.iter().enumerate() {
        match b {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            _ if depth == 0 && keyword_at(bytes, at, b"WHERE") => found = Some(at),
            _ => {},
        }
    }

    found
}

/// Restrict `mdx` to one fiscal year.
///
/// Everything from the last `WHERE` on is replaced by the fiscal-year
/// slicer; without a `WHERE` the slicer is appended.
pub fn with_fiscal_year(mdx: &str, fiscal_year: u16) -> String {
    let slicer = format!("WHERE ({}.&[{}])", FISCAL_YEAR_LEVEL, fiscal_year);
    let head = match last_where(mdx) {
        Some(idx) => &mdx[..idx],
        None => mdx,
    };
    format!("{}\n{}\n", head.trim_end(), slicer)
}

/// One partition of a refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshSlice {
    FiscalYear(u16),
    /// Run with one template variable pinned
    Variable { name: String, value: String },
}

impl RefreshSlice {
    pub fn fiscal_years(years: &[u16]) -> Vec<Self> {
        years.iter().copied().map(Self::FiscalYear).collect()
    }

    pub fn variable_values(name: &str, values: &[String]) -> Vec<Self> {
        values
            .iter()
            .map(|value| Self::Variable {
                name: name.to_string(),
                value: value.clone(),
            })
            .collect()
    }

    /// MDX for this slice of `pipeline`. Template variables are rendered
    /// first, so a fiscal-year slicer replaces a templated `WHERE` too.
    pub fn render(&self, pipeline: &PipelineDefinition, variables: &HashMap<String, String>) -> String {
        match self {
            Self::FiscalYear(year) => with_fiscal_year(&pipeline.render_mdx(variables), *year),
            Self::Variable { name, value } => {
                let mut variables = variables.clone();
                variables.insert(name.clone(), value.clone());
                pipeline.render_mdx(&variables)
            },
        }
    }
}

impl fmt::Display for RefreshSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FiscalYear(year) => write!(f, "FY{}", year),
            Self::Variable { name, value } => write!(f, "{}={}", name, value),
        }
    }
}
