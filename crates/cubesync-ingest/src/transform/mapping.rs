//! Declarative field, measure and business-key mapping for one pipeline
//!
//! Loaded from YAML:
//!
//! ```yaml
//! table: crf63_oarsbidatas
//! alternate_key: crf63_businesskey
//! fields:
//!   StoreNumber: { dataverse: crf63_storenumber, type: string }
//!   CalendarDate: { dataverse: crf63_calendardate, type: date }
//! measures:
//!   TY Net Sales USD: { dataverse: crf63_tynetsales, type: decimal, default: 0 }
//! business_key:
//!   format: "{StoreNumber}_{CalendarDate:%Y%m%d}"
//! display_name:
//!   dataverse: crf63_name
//!   format: "{StoreNumber} - {CalendarDate:%Y%m%d}"
//! ```

use cubesync_common::types::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::template::{validate_strftime, KeyTemplate};
use crate::error::{IngestError, Result};

// ============================================================================
// Mapping Defaults
// ============================================================================

/// Alternate key column used when the mapping does not name one
pub const DEFAULT_ALTERNATE_KEY: &str = "crf63_businesskey";

/// Provenance column stamped on every record
pub const DEFAULT_LAST_REFRESHED_FIELD: &str = "crf63_lastrefreshed";

/// Dimension column mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub dataverse: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
}

/// Measure column mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureSpec {
    pub dataverse: String,
    #[serde(rename = "type", default = "default_measure_type")]
    pub field_type: FieldType,
    /// Written when the cube returns no value for the measure
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

fn default_measure_type() -> FieldType {
    FieldType::Decimal
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessKeySpec {
    pub format: String,
    /// Replace whitespace in the rendered key with `_`
    #[serde(default)]
    pub sanitize: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayNameSpec {
    pub dataverse: String,
    pub format: String,
}

/// Complete mapping for one target table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMapping {
    /// Entity set name, e.g. `crf63_oarsbidatas`
    pub table: String,
    #[serde(default = "default_alternate_key")]
    pub alternate_key: String,
    /// Primary id column; derived from the table name when absent
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(default = "default_last_refreshed")]
    pub last_refreshed: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub measures: BTreeMap<String, MeasureSpec>,
    pub business_key: BusinessKeySpec,
    #[serde(default)]
    pub display_name: Option<DisplayNameSpec>,
}

/// Primary id column Dataverse derives from an entity set name:
/// the singular logical name plus `id`.
pub fn default_id_field(table: &str) -> String {
    format!("{}id", table.strip_suffix('s').unwrap_or(table))
}

fn default_alternate_key() -> String {
    DEFAULT_ALTERNATE_KEY.to_string()
}

fn default_last_refreshed() -> String {
    DEFAULT_LAST_REFRESHED_FIELD.to_string()
}

impl PipelineMapping {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mapping: PipelineMapping = serde_yaml::from_str(yaml)?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            IngestError::config(format!("Cannot read mapping {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Primary id column of the table, e.g. `crf63_oarsbidataid`.
    pub fn id_field(&self) -> String {
        match &self.id_field {
            Some(id) => id.clone(),
            None => default_id_field(&self.table),
        }
    }

    pub fn key_template(&self) -> Result<KeyTemplate> {
        self.checked_template(&self.business_key.format, "business_key.format")
    }

    pub fn display_template(&self) -> Result<Option<(String, KeyTemplate)>> {
        match &self.display_name {
            Some(spec) => Ok(Some((
                spec.dataverse.clone(),
                self.checked_template(&spec.format, "display_name.format")?,
            ))),
            None => Ok(None),
        }
    }

    /// Check the mapping once at load time.
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(IngestError::config("Mapping is missing 'table'"));
        }
        if self.alternate_key.trim().is_empty() {
            return Err(IngestError::config("Mapping 'alternate_key' must not be empty"));
        }
        for (source, spec) in &self.fields {
            if spec.dataverse.trim().is_empty() {
                return Err(IngestError::config(format!(
                    "Field '{}' has no dataverse column",
                    source
                )));
            }
        }
        for (source, spec) in &self.measures {
            if spec.dataverse.trim().is_empty() {
                return Err(IngestError::config(format!(
                    "Measure '{}' has no dataverse column",
                    source
                )));
            }
        }

        self.key_template()?;
        self.display_template()?;
        Ok(())
    }

    fn checked_template(&self, format: &str, what: &str) -> Result<KeyTemplate> {
        if format.trim().is_empty() {
            return Err(IngestError::config(format!("Mapping is missing {}", what)));
        }
        let template = KeyTemplate::parse(format)?;

        for (field, spec) in template.fields() {
            let declared = self.fields.get(field).ok_or_else(|| {
                IngestError::config(format!(
                    "{} references '{}', which is not a mapped field",
                    what, field
                ))
            })?;
            if let Some(spec) = spec {
                if declared.field_type != FieldType::Date {
                    return Err(IngestError::config(format!(
                        "{} applies format '{}' to non-date field '{}'",
                        what, spec, field
                    )));
                }
                validate_strftime(spec)?;
            }
        }

        Ok(template)
    }
}
