//! Pipeline definitions loaded from `pipelines.yaml`

use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};
use crate::xmla::HierarchyRule;

/// One named cube query and where its rows go
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    pub name: String,
    /// MDX template; `${var}` placeholders are filled at run time
    pub mdx: String,
    pub catalog: Option<String>,
    /// Resolved against the pipelines file's directory
    pub mapping_path: PathBuf,
    pub hierarchy_mappings: Vec<HierarchyRule>,
    /// Default template variables, overridable from the command line
    pub variables: BTreeMap<String, String>,
}

impl PipelineDefinition {
    /// The MDX with defaults overlaid by `overrides`.
    pub fn render_mdx(&self, overrides: &HashMap<String, String>) -> String {
        let mut variables: HashMap<String, String> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        variables.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        render_mdx_template(&self.mdx, &variables)
    }
}

#[derive(Debug, Deserialize)]
struct PipelinesFile {
    #[serde(default)]
    pipelines: BTreeMap<String, RawPipeline>,
}

#[derive(Debug, Deserialize)]
struct RawPipeline {
    #[serde(default)]
    mdx: String,
    #[serde(default)]
    catalog: Option<String>,
    #[serde(default)]
    mapping: Option<String>,
    #[serde(default)]
    hierarchy_mappings: Vec<HierarchyRule>,
    #[serde(default)]
    variables: BTreeMap<String, Value>,
}

/// Substitute `${name}` placeholders.
///
/// MDX is full of `{ ... }` sets, so bare braces are never touched and
/// placeholders with no matching variable are left as they are.
pub fn render_mdx_template(mdx: &str, variables: &HashMap<String, String>) -> String {
    variables.iter().fold(mdx.to_string(), |rendered, (key, value)| {
        rendered.replace(&format!("${{{}}}", key), value)
    })
}

fn scalar_text(name: &str, key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(IngestError::config(format!(
            "pipeline '{}': variable '{}' must be a scalar",
            name, key
        ))),
    }
}

/// Parse pipeline definitions. Relative mapping paths are joined onto
/// `base_dir`.
pub fn parse_pipelines(yaml: &str, base_dir: &Path) -> Result<BTreeMap<String, PipelineDefinition>> {
    let file: PipelinesFile = serde_yaml::from_str(yaml)?;
    let mut out = BTreeMap::new();

    for (name, raw) in file.pipelines {
        let mdx = raw.mdx.trim_matches('\n').to_string();
        if mdx.trim().is_empty() {
            return Err(IngestError::config(format!("pipeline '{}' is missing mdx", name)));
        }
        let mapping = raw
            .mapping
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| IngestError::config(format!("pipeline '{}' is missing mapping", name)))?;

        let mapping_path = PathBuf::from(&mapping);
        let mapping_path = if mapping_path.is_absolute() {
            mapping_path
        } else {
            base_dir.join(mapping_path)
        };

        let variables = raw
            .variables
            .iter()
            .map(|(key, value)| Ok((key.clone(), scalar_text(&name, key, value)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        out.insert(
            name.clone(),
            PipelineDefinition {
                name,
                mdx,
                catalog: raw.catalog.filter(|c| !c.trim().is_empty()),
                mapping_path,
                hierarchy_mappings: raw.hierarchy_mappings,
                variables,
            },
        );
    }

    Ok(out)
}

/// Load every pipeline from `path`.
pub fn load_pipelines(path: &Path) -> Result<BTreeMap<String, PipelineDefinition>> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        IngestError::config(format!("cannot read pipelines file {}: {}", path.display(), e))
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_pipelines(&yaml, base_dir)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    const PIPELINES: &str = r#"
pipelines:
  store_daily:
    catalog: OARS BI
    mapping: mappings/store_daily.yaml
    hierarchy_mappings:
      - { pattern: "Franchise.*Store", field: StoreNumber }
      - { pattern: "Calendar Date", field: CalendarDate }
    variables:
      myview_id: 81
      fiscal_year: "FY2025"
    mdx: |
      SELECT {[Measures].[TY Net Sales USD]} ON COLUMNS,
      NON EMPTY {[Franchise].[Franchise Store].Members} ON ROWS
      FROM [OARS] WHERE ([My View].[${myview_id}], [Fiscal].[${fiscal_year}])
"#;

    #[test]
    fn test_parse_pipelines() {
        let pipelines = parse_pipelines(PIPELINES, Path::new("/etc/cubesync")).unwrap();
        let p = &pipelines["store_daily"];

        assert_eq!(p.catalog.as_deref(), Some("OARS BI"));
        assert_eq!(p.mapping_path, PathBuf::from("/etc/cubesync/mappings/store_daily.yaml"));
        assert_eq!(p.hierarchy_mappings.len(), 2);
        assert_eq!(p.hierarchy_mappings[0].field, "StoreNumber");
        assert_eq!(p.variables["myview_id"], "81");
        assert!(p.mdx.starts_with("SELECT"));
    }

    #[test]
    fn test_render_with_overrides() {
        let pipelines = parse_pipelines(PIPELINES, Path::new(".")).unwrap();
        let overrides = HashMap::from([("fiscal_year".to_string(), "FY2024".to_string())]);
        let mdx = pipelines["store_daily"].render_mdx(&overrides);

        assert!(mdx.contains("[My View].[81]"));
        assert!(mdx.contains("[Fiscal].[FY2024]"));
        assert!(mdx.contains("{[Measures].[TY Net Sales USD]}"));
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let vars = HashMap::from([("a".to_string(), "1".to_string())]);
        assert_eq!(render_mdx_template("{x} ${a} ${b}", &vars), "{x} 1 ${b}");
    }

    #[test]
    fn test_missing_mdx_or_mapping() {
        let no_mdx = "pipelines:\n  p:\n    mapping: m.yaml\n";
        assert!(parse_pipelines(no_mdx, Path::new(".")).is_err());

        let no_mapping = "pipelines:\n  p:\n    mdx: SELECT 1\n";
        let err = parse_pipelines(no_mapping, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("missing mapping"));
    }

    #[test]
    fn test_load_resolves_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipelines.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(PIPELINES.as_bytes()).unwrap();

        let pipelines = load_pipelines(&path).unwrap();
        assert_eq!(
            pipelines["store_daily"].mapping_path,
            dir.path().join("mappings/store_daily.yaml")
        );
    }

    #[test]
    fn test_shipped_pipelines_load() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../pipelines/pipelines.yaml");
        let pipelines = load_pipelines(&path).unwrap();
        assert!(!pipelines.is_empty());
        for pipeline in pipelines.values() {
            crate::transform::PipelineMapping::load(&pipeline.mapping_path).unwrap();
        }
    }

    #[test]
    fn test_shipped_sales_channel_pipeline() {
        use crate::transform::{PipelineMapping, Transformer};
        use crate::xmla::HierarchyMapper;
        use cubesync_common::types::{CellValue, Row};

        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../pipelines/pipelines.yaml");
        let pipelines = load_pipelines(&path).unwrap();
        let sales = &pipelines["sales_channel"];

        assert!(sales.render_mdx(&HashMap::new()).contains("[My View].&[81])"));
        let overrides = HashMap::from([("myview_id".to_string(), "82".to_string())]);
        let mdx = sales.render_mdx(&overrides);
        assert!(mdx.contains("[My View].&[82])"));
        assert!(!mdx.contains("${"));

        let mapper = HierarchyMapper::new(&sales.hierarchy_mappings).unwrap();
        assert_eq!(mapper.resolve("[Source Channel].[Source Actor]"), Some("SourceActor"));
        assert_eq!(mapper.resolve("[Source Channel].[Source Channel]"), Some("SourceChannel"));
        assert_eq!(mapper.resolve("[Franchise].[Store Number Label]"), Some("StoreNumber"));
        assert_eq!(mapper.resolve("[Day Part Dimension].[Day Part]"), Some("DayPart"));

        let mapping = PipelineMapping::load(&sales.mapping_path).unwrap();
        assert_eq!(mapping.id_field(), "crf63_saleschanneldailyid");

        let mut row = Row::new();
        row.insert("StoreNumber", CellValue::text("1042"));
        row.insert("CalendarDate", CellValue::text("11/5/2025"));
        row.insert("SourceActor", CellValue::text("Desktop Web"));
        row.insert("SourceChannel", CellValue::text("Online"));
        row.insert("DayPart", CellValue::text("Dinner"));
        row.insert("TY Orders", CellValue::Number(14.0));
        let record = Transformer::new(mapping)
            .unwrap()
            .build_record(&row, "2025-11-06T05:00:00Z")
            .unwrap();
        assert_eq!(record.business_key, "1042_20251105_Desktop_Web_Online_Dinner");
    }
}
