//! Pipeline execution: cube query, parse, transform, upsert

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::definition::PipelineDefinition;
use super::slice::RefreshSlice;
use crate::dataverse::{
    DeleteEngine, DeleteOptions, DeleteSummary, UpsertEngine, UpsertOptions, WebApi,
};
use crate::error::{IngestError, Result};
use crate::progress::throughput;
use crate::transform::{PipelineMapping, Transformer};
use crate::xmla::{CellSetParser, XmlaClient};

/// Anything that can answer an MDX query with an XMLA response body
#[async_trait]
pub trait CubeSource: Send + Sync {
    async fn execute(&self, mdx: &str, catalog: &str) -> Result<String>;
}

#[async_trait]
impl CubeSource for XmlaClient {
    async fn execute(&self, mdx: &str, catalog: &str) -> Result<String> {
        XmlaClient::execute(self, mdx, catalog).await
    }
}

/// What one pipeline run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub pipeline: String,
    pub table: String,
    /// Refresh slice this run covered, if any
    pub slice: Option<String>,
    /// Rows parsed from the cube response
    pub rows: usize,
    /// Records built from those rows
    pub records: usize,
    /// Rows dropped for lacking a business key
    pub dropped: usize,
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
    pub elapsed: Duration,
    /// Upsert was skipped
    pub dry_run: bool,
}

impl PipelineReport {
    /// Successful records per second over the whole run
    pub fn throughput(&self) -> f64 {
        throughput(self.created + self.updated, self.elapsed)
    }
}

impl std::fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pipeline)?;
        if let Some(slice) = &self.slice {
            write!(f, " [{}]", slice)?;
        }
        write!(
            f,
            " -> {}: rows={} records={} dropped={}",
            self.table, self.rows, self.records, self.dropped
        )?;
        if self.dry_run {
            return write!(f, " (dry run)");
        }
        write!(
            f,
            " created={} updated={} errors={} elapsed={:.1}s rate={:.1}/s",
            self.created,
            self.updated,
            self.errors,
            self.elapsed.as_secs_f64(),
            self.throughput()
        )
    }
}

/// How a refresh is carried out
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    /// One load per slice; empty means a single unsliced load
    pub slices: Vec<RefreshSlice>,
    /// Leave the table as it is, e.g. when it was emptied server-side
    pub skip_delete: bool,
    /// Query and transform each slice, but neither purge nor upsert
    pub dry_run: bool,
}

impl RefreshOptions {
    pub fn with_slices(mut self, slices: Vec<RefreshSlice>) -> Self {
        self.slices = slices;
        self
    }

    pub fn with_skip_delete(mut self, skip_delete: bool) -> Self {
        self.skip_delete = skip_delete;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// What a refresh did: the purge (unless skipped) and one report per slice
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub purged: Option<DeleteSummary>,
    pub slices: Vec<PipelineReport>,
}

impl RefreshReport {
    pub fn created(&self) -> usize {
        self.slices.iter().map(|r| r.created).sum()
    }

    pub fn updated(&self) -> usize {
        self.slices.iter().map(|r| r.updated).sum()
    }

    pub fn errors(&self) -> usize {
        self.slices.iter().map(|r| r.errors).sum()
    }

    /// Slices whose query returned no rows
    pub fn empty_slices(&self) -> usize {
        self.slices.iter().filter(|r| r.rows == 0).count()
    }
}

/// Per-pipeline pieces built once and shared by every slice
struct Prepared {
    parser: CellSetParser,
    transformer: Transformer,
    table: String,
    catalog: String,
}

pub struct PipelineRunner<A: WebApi + ?Sized> {
    cube: Arc<dyn CubeSource>,
    api: Arc<A>,
    default_catalog: Option<String>,
    upsert: UpsertOptions,
    delete: DeleteOptions,
}

impl<A: WebApi + ?Sized> PipelineRunner<A> {
    pub fn new(cube: Arc<dyn CubeSource>, api: Arc<A>) -> Self {
        Self {
            cube,
            api,
            default_catalog: None,
            upsert: UpsertOptions::default(),
            delete: DeleteOptions::default(),
        }
    }

    /// Catalog used for pipelines that do not name one
    pub fn with_default_catalog(mut self, catalog: Option<String>) -> Self {
        self.default_catalog = catalog;
        self
    }

    pub fn with_upsert_options(mut self, options: UpsertOptions) -> Self {
        self.upsert = options;
        self
    }

    pub fn with_delete_options(mut self, options: DeleteOptions) -> Self {
        self.delete = options;
        self
    }

    fn catalog_for(&self, pipeline: &PipelineDefinition) -> Result<String> {
        pipeline
            .catalog
            .clone()
            .or_else(|| self.default_catalog.clone())
            .ok_or_else(|| {
                IngestError::config(format!(
                    "pipeline '{}' has no catalog and XMLA_CATALOG is not set",
                    pipeline.name
                ))
            })
    }

    /// Run `pipeline` end to end. With `dry_run` nothing is written.
    pub async fn run(
        &self,
        pipeline: &PipelineDefinition,
        variables: &HashMap<String, String>,
        dry_run: bool,
    ) -> Result<PipelineReport> {
        let mapping = PipelineMapping::load(&pipeline.mapping_path)?;
        self.run_with_mapping(pipeline, mapping, variables, dry_run).await
    }

    pub async fn run_with_mapping(
        &self,
        pipeline: &PipelineDefinition,
        mapping: PipelineMapping,
        variables: &HashMap<String, String>,
        dry_run: bool,
    ) -> Result<PipelineReport> {
        let prepared = self.prepare(pipeline, mapping)?;
        let mdx = pipeline.render_mdx(variables);
        self.load(pipeline, &prepared, &mdx, None, dry_run).await
    }

    fn prepare(&self, pipeline: &PipelineDefinition, mapping: PipelineMapping) -> Result<Prepared> {
        let parser = CellSetParser::from_rules(&pipeline.hierarchy_mappings)?;
        let transformer = Transformer::new(mapping)?;
        let table = transformer.mapping().table.clone();
        let catalog = self.catalog_for(pipeline)?;
        Ok(Prepared {
            parser,
            transformer,
            table,
            catalog,
        })
    }

    /// Query, parse, transform and (unless `dry_run`) upsert one MDX statement.
    async fn load(
        &self,
        pipeline: &PipelineDefinition,
        prepared: &Prepared,
        mdx: &str,
        slice: Option<String>,
        dry_run: bool,
    ) -> Result<PipelineReport> {
        let started = Instant::now();
        let table = &prepared.table;

        info!(
            pipeline = %pipeline.name,
            table = %table,
            catalog = %prepared.catalog,
            slice = slice.as_deref().unwrap_or("-"),
            "Running pipeline"
        );

        let xml = self.cube.execute(mdx, &prepared.catalog).await?;
        let rows = prepared.parser.parse(&xml)?;

        let mut report = PipelineReport {
            pipeline: pipeline.name.clone(),
            table: table.clone(),
            slice,
            rows: rows.len(),
            dry_run,
            ..PipelineReport::default()
        };

        if rows.is_empty() {
            warn!(
                pipeline = %pipeline.name,
                slice = report.slice.as_deref().unwrap_or("-"),
                "Cube returned no rows; skipping"
            );
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        let output = prepared.transformer.transform(&rows);
        report.records = output.records.len();
        report.dropped = output.dropped;

        if dry_run {
            info!(pipeline = %pipeline.name, records = report.records, "Dry run; skipping upsert");
        } else if output.records.is_empty() {
            warn!(pipeline = %pipeline.name, "No records to upsert");
        } else {
            let engine = UpsertEngine::new(Arc::clone(&self.api), self.upsert.clone());
            let summary = engine.upsert(table, &output.records).await?;
            report.created = summary.created;
            report.updated = summary.updated;
            report.errors = summary.errors;
        }

        report.elapsed = started.elapsed();
        info!(
            pipeline = %pipeline.name,
            rows = report.rows,
            records = report.records,
            dropped = report.dropped,
            created = report.created,
            updated = report.updated,
            errors = report.errors,
            rows_per_sec = format!("{:.1}", report.throughput()),
            "Pipeline complete"
        );
        Ok(report)
    }

    /// Delete every row of `table`.
    pub async fn purge(&self, table: &str, id_field: &str) -> Result<DeleteSummary> {
        DeleteEngine::new(Arc::clone(&self.api), self.delete.clone())
            .delete_all(table, id_field)
            .await
    }

    /// Empty the pipeline's table, then reload it slice by slice.
    ///
    /// A stalled purge stops the refresh before anything is reloaded. Slices
    /// run in order; one whose query returns no rows is reported and skipped.
    pub async fn refresh(
        &self,
        pipeline: &PipelineDefinition,
        variables: &HashMap<String, String>,
        options: &RefreshOptions,
    ) -> Result<RefreshReport> {
        let mapping = PipelineMapping::load(&pipeline.mapping_path)?;
        let id_field = mapping.id_field();
        let prepared = self.prepare(pipeline, mapping)?;
        let mut report = RefreshReport::default();

        if options.skip_delete || options.dry_run {
            info!(
                table = %prepared.table,
                skip_delete = options.skip_delete,
                dry_run = options.dry_run,
                "Skipping purge"
            );
        } else {
            let purged = self.purge(&prepared.table, &id_field).await?;
            purged.ensure_complete(&prepared.table)?;
            report.purged = Some(purged);
        }

        if options.slices.is_empty() {
            let mdx = pipeline.render_mdx(variables);
            let run = self.load(pipeline, &prepared, &mdx, None, options.dry_run).await?;
            report.slices.push(run);
            return Ok(report);
        }

        for slice in &options.slices {
            if !options.dry_run {
                self.api.refresh_auth(false).await?;
            }
            let mdx = slice.render(pipeline, variables);
            let run = self
                .load(pipeline, &prepared, &mdx, Some(slice.to_string()), options.dry_run)
                .await?;
            report.slices.push(run);
        }

        info!(
            pipeline = %pipeline.name,
            slices = report.slices.len(),
            empty_slices = report.empty_slices(),
            created = report.created(),
            updated = report.updated(),
            errors = report.errors(),
            "Refresh complete"
        );
        Ok(report)
    }
}
