//! cubesync-ingest - OLAP cube to Dataverse sync tool

use anyhow::{bail, Context, Result};
use clap::Parser;
use cubesync_common::logging::{init_logging, LogConfig, LogLevel};
use cubesync_ingest::config::{DataverseConfig, SyncConfig, XmlaConfig};
use cubesync_ingest::dataverse::DataverseClient;
use cubesync_ingest::pipeline::{
    load_pipelines, PipelineDefinition, PipelineRunner, RefreshOptions, RefreshSlice,
};
use cubesync_ingest::transform::mapping::default_id_field;
use cubesync_ingest::xmla::XmlaClient;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cubesync-ingest")]
#[command(author, version, about = "Sync OLAP cube query results into Dataverse tables")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Pipelines file (overrides PIPELINES_FILE)
    #[arg(long, global = true)]
    pipelines: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Query the cube and upsert the results
    Run {
        /// Pipeline to run
        #[arg(short, long, conflicts_with = "all", required_unless_present = "all")]
        pipeline: Option<String>,

        /// Run every configured pipeline
        #[arg(long)]
        all: bool,

        /// Template variable, e.g. --var myview_id=81
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Print the rendered MDX before running
        #[arg(long)]
        print_mdx: bool,

        /// Parse and transform only; write nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete every row of a table
    Purge {
        /// Entity set name, e.g. crf63_oarsbidatas
        #[arg(short, long)]
        table: String,

        /// Primary id column; derived from the table name when omitted
        #[arg(long)]
        id_field: Option<String>,
    },

    /// Purge a pipeline's table and reload it, optionally in slices
    Refresh {
        #[arg(short, long)]
        pipeline: String,

        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Reload one fiscal year per slice, replacing the MDX WHERE clause
        /// (repeatable, e.g. --fiscal-year 2023 --fiscal-year 2024)
        #[arg(long = "fiscal-year", conflicts_with = "each")]
        fiscal_years: Vec<u16>,

        /// Reload one slice per value of a template variable,
        /// e.g. --each myview_id=81,82
        #[arg(long, value_parser = parse_each)]
        each: Option<VariableValues>,

        /// Keep the table's current rows (e.g. already emptied server-side)
        #[arg(long)]
        skip_delete: bool,

        /// Query and transform each slice; neither purge nor upsert
        #[arg(long)]
        dry_run: bool,

        /// Concurrent delete batches (overrides DELETE_MAX_CONCURRENCY)
        #[arg(long)]
        delete_workers: Option<usize>,

        /// Deletes per batch (overrides DELETE_BATCH_SIZE)
        #[arg(long)]
        delete_batch_size: Option<usize>,

        /// Ids fetched per delete page (overrides DELETE_PAGE_SIZE)
        #[arg(long)]
        delete_page_size: Option<usize>,

        /// Confirm the table may be emptied
        #[arg(long)]
        yes: bool,
    },

    /// List configured pipelines
    List,
}

fn parse_var(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(k, _)| !k.trim().is_empty())
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

/// `name=v1,v2,...` for `--each`
#[derive(Debug, Clone)]
struct VariableValues {
    name: String,
    values: Vec<String>,
}

fn parse_each(raw: &str) -> std::result::Result<VariableValues, String> {
    let (name, values) = parse_var(raw)?;
    let values: Vec<String> = values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        return Err(format!("expected name=v1,v2,..., got '{}'", raw));
    }
    Ok(VariableValues { name, values })
}

fn build_runner(sync: &SyncConfig, show_progress: bool) -> Result<PipelineRunner<DataverseClient>> {
    let xmla = XmlaConfig::from_env().context("Invalid XMLA configuration")?;
    let dataverse = DataverseConfig::from_env().context("Invalid Dataverse configuration")?;

    let cube = XmlaClient::new(&xmla).context("Failed to build XMLA client")?;
    let tokens = dataverse.token_provider(reqwest::Client::new())?;
    let api = DataverseClient::new(&dataverse, tokens).context("Failed to build Dataverse client")?;

    Ok(PipelineRunner::new(Arc::new(cube), Arc::new(api))
        .with_default_catalog(xmla.catalog)
        .with_upsert_options(sync.upsert.clone().with_progress(show_progress))
        .with_delete_options(sync.delete.clone()))
}

fn select<'a>(
    pipelines: &'a BTreeMap<String, PipelineDefinition>,
    name: &str,
) -> Result<&'a PipelineDefinition> {
    match pipelines.get(name) {
        Some(p) => Ok(p),
        None => bail!(
            "Unknown pipeline '{}'. Known: {}",
            name,
            pipelines.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("cubesync-ingest")
        .build()
        .merge_env()?;
    let log_config = if cli.verbose {
        LogConfig {
            level: LogLevel::Debug,
            ..log_config
        }
    } else {
        log_config
    };
    let _log_guard = init_logging(&log_config)?;

    let sync = SyncConfig::from_env().context("Invalid sync configuration")?;
    let pipelines_file = cli.pipelines.clone().unwrap_or_else(|| sync.pipelines_file.clone());

    match cli.command {
        Command::List => {
            let pipelines = load_pipelines(&pipelines_file)
                .with_context(|| format!("Failed to load {}", pipelines_file.display()))?;
            for (name, p) in &pipelines {
                println!(
                    "{:<32} catalog={:<16} mapping={}",
                    name,
                    p.catalog.as_deref().unwrap_or("-"),
                    p.mapping_path.display()
                );
            }
        },
        Command::Run {
            pipeline,
            all,
            vars,
            print_mdx,
            dry_run,
        } => {
            let pipelines = load_pipelines(&pipelines_file)
                .with_context(|| format!("Failed to load {}", pipelines_file.display()))?;
            let selected: Vec<&PipelineDefinition> = if all {
                pipelines.values().collect()
            } else {
                let name = pipeline.context("--pipeline or --all is required")?;
                vec![select(&pipelines, &name)?]
            };
            let vars: HashMap<String, String> = vars.into_iter().collect();
            let runner = build_runner(&sync, true)?;

            let mut failed = 0;
            for p in selected {
                if print_mdx {
                    println!("-- {}\n{}\n", p.name, p.render_mdx(&vars));
                }
                match runner.run(p, &vars, dry_run).await {
                    Ok(report) => println!("{}", report),
                    Err(e) => {
                        error!(pipeline = %p.name, error = %e, "Pipeline failed");
                        failed += 1;
                    },
                }
            }
            if failed > 0 {
                bail!("{} pipeline(s) failed", failed);
            }
        },
        Command::Purge { table, id_field } => {
            let id_field = id_field.unwrap_or_else(|| default_id_field(&table));
            let runner = build_runner(&sync, false)?;
            let summary = runner
                .purge(&table, &id_field)
                .await
                .with_context(|| format!("Failed to purge {}", table))?;
            println!(
                "{}: deleted={} failed_batches={} pages={}{}",
                table,
                summary.deleted,
                summary.failed_batches,
                summary.pages,
                if summary.stalled { " (stalled)" } else { "" }
            );
            summary.ensure_complete(&table)?;
        },
        Command::Refresh {
            pipeline,
            vars,
            fiscal_years,
            each,
            skip_delete,
            dry_run,
            delete_workers,
            delete_batch_size,
            delete_page_size,
            yes,
        } => {
            if !yes && !skip_delete && !dry_run {
                bail!("refresh empties the target table; pass --yes to confirm (or --skip-delete)");
            }
            let pipelines = load_pipelines(&pipelines_file)
                .with_context(|| format!("Failed to load {}", pipelines_file.display()))?;
            let p = select(&pipelines, &pipeline)?;
            let vars: HashMap<String, String> = vars.into_iter().collect();

            let mut sync = sync;
            if let Some(workers) = delete_workers {
                sync.delete = sync.delete.with_max_concurrency(workers.max(1));
            }
            if let Some(size) = delete_batch_size {
                sync.delete = sync.delete.with_batch_size(size.max(1));
            }
            if let Some(size) = delete_page_size {
                sync.delete = sync.delete.with_page_size(size.max(1));
            }
            sync.validate().context("Invalid delete options")?;

            let slices = match each {
                Some(each) => RefreshSlice::variable_values(&each.name, &each.values),
                None => RefreshSlice::fiscal_years(&fiscal_years),
            };
            let options = RefreshOptions::default()
                .with_slices(slices)
                .with_skip_delete(skip_delete)
                .with_dry_run(dry_run);
            let runner = build_runner(&sync, true)?;

            let report = runner
                .refresh(p, &vars, &options)
                .await
                .with_context(|| format!("Refresh of '{}' failed", p.name))?;
            match &report.purged {
                Some(purged) => println!("purged {} rows", purged.deleted),
                None => println!("purge skipped"),
            }
            for slice in &report.slices {
                println!("{}", slice);
            }
            println!(
                "total: created={} updated={} errors={} empty_slices={}",
                report.created(),
                report.updated(),
                report.errors(),
                report.empty_slices()
            );
        },
    }

    info!("Done");
    Ok(())
}
