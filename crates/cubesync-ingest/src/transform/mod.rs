//! Row to record transformation
//!
//! Applies a [`PipelineMapping`] to parsed cube rows: coerces dimension and
//! measure values, derives the business key, and stamps provenance.
//!
//! Rows whose key cannot be built are dropped and counted. Measures that fail
//! coercion are simply omitted from the record.

pub mod coerce;
pub mod mapping;
pub mod template;

use chrono::{SecondsFormat, Utc};
use cubesync_common::types::{Record, Row};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

pub use coerce::{coerce, parse_date, Coerced};
pub use mapping::{BusinessKeySpec, FieldSpec, MeasureSpec, PipelineMapping};
pub use template::KeyTemplate;

use crate::error::{IngestError, Result};

/// Records produced by one transform pass
#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub records: Vec<Record>,
    /// Rows skipped because their business key could not be built
    pub dropped: usize,
}

/// Mapping-driven transformer for one pipeline
#[derive(Debug, Clone)]
pub struct Transformer {
    mapping: PipelineMapping,
    key: KeyTemplate,
    display: Option<(String, KeyTemplate)>,
}

impl Transformer {
    pub fn new(mapping: PipelineMapping) -> Result<Self> {
        mapping.validate()?;
        let key = mapping.key_template()?;
        let display = mapping.display_template()?;
        Ok(Self {
            mapping,
            key,
            display,
        })
    }

    pub fn mapping(&self) -> &PipelineMapping {
        &self.mapping
    }

    /// Build the record for one row.
    ///
    /// Fails with [`IngestError::MissingKeyField`] when a key input is null
    /// after coercion. The key is resolved before any measure default is
    /// applied.
    pub fn build_record(&self, row: &Row, refreshed_at: &str) -> Result<Record> {
        let mut columns: Vec<(String, Value)> = Vec::new();
        let mut values: HashMap<&str, Coerced> = HashMap::new();

        for (source, spec) in &self.mapping.fields {
            let coerced = row
                .get(source)
                .and_then(|value| coerce(value, spec.field_type));
            if let Some(coerced) = coerced {
                columns.push((spec.dataverse.clone(), coerced.to_json()));
                values.insert(source.as_str(), coerced);
            }
        }

        let mut business_key = self.key.render(&values)?;
        if self.mapping.business_key.sanitize {
            business_key = business_key
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("_");
        }
        if business_key.trim().is_empty() {
            return Err(IngestError::missing_key_field(self.mapping.alternate_key.clone()));
        }

        let mut record = Record::new(self.mapping.alternate_key.clone(), business_key);
        for (column, value) in columns {
            record.set(column, value);
        }

        for (source, spec) in &self.mapping.measures {
            let value = row
                .get(source)
                .and_then(|value| coerce(value, spec.field_type))
                .map(|coerced| coerced.to_json())
                .or_else(|| spec.default.clone());
            if let Some(value) = value {
                record.set(spec.dataverse.clone(), value);
            }
        }

        if let Some((column, template)) = &self.display {
            if let Ok(name) = template.render(&values) {
                if !record.fields.contains_key(column) {
                    record.set(column.clone(), Value::String(name));
                }
            }
        }

        record.set(
            self.mapping.last_refreshed.clone(),
            Value::String(refreshed_at.to_string()),
        );

        Ok(record)
    }

    /// Transform rows in order. Every record of the pass shares one
    /// last-refreshed timestamp.
    pub fn transform(&self, rows: &[Row]) -> TransformOutput {
        let refreshed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut output = TransformOutput {
            records: Vec::with_capacity(rows.len()),
            dropped: 0,
        };
        let mut seen_keys: HashSet<String> = HashSet::with_capacity(rows.len());
        let mut duplicates = 0usize;

        for (index, row) in rows.iter().enumerate() {
            match self.build_record(row, &refreshed_at) {
                Ok(record) => {
                    if !seen_keys.insert(record.business_key.clone()) {
                        duplicates += 1;
                    }
                    output.records.push(record);
                },
                Err(IngestError::MissingKeyField { field }) => {
                    debug!(row = index, field = %field, "Dropping row without business key");
                    output.dropped += 1;
                },
                Err(e) => {
                    warn!(row = index, error = %e, "Dropping row that failed to transform");
                    output.dropped += 1;
                },
            }
        }

        if duplicates > 0 {
            warn!(
                table = %self.mapping.table,
                duplicates,
                "Rows share a business key; the last write wins"
            );
        }

        info!(
            table = %self.mapping.table,
            rows = rows.len(),
            kept = output.records.len(),
            dropped = output.dropped,
            "Transformed rows into records"
        );

        output
    }
}
