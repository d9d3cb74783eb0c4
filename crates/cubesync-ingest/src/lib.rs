//! cube-sync ingestion library
//!
//! One-way sync from an OLAP cube into Dataverse tables.
//!
//! # Flow
//!
//! 1. [`xmla::XmlaClient`] runs a pipeline's MDX against the cube.
//! 2. [`xmla::CellSetParser`] flattens the cell set into rows, naming
//!    dimension columns through the pipeline's hierarchy rules.
//! 3. [`transform::Transformer`] coerces values and builds the business key
//!    of each record.
//! 4. [`dataverse::UpsertEngine`] writes records in concurrent `$batch`
//!    requests and reports created/updated/error counts.
//!
//! [`dataverse::DeleteEngine`] empties a table ahead of a full reload.
//!
//! # Example
//!
//! ```no_run
//! use cubesync_ingest::config::{DataverseConfig, SyncConfig, XmlaConfig};
//! use cubesync_ingest::dataverse::DataverseClient;
//! use cubesync_ingest::pipeline::{load_pipelines, PipelineRunner};
//! use cubesync_ingest::xmla::XmlaClient;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let sync = SyncConfig::from_env()?;
//!     let xmla = XmlaConfig::from_env()?;
//!     let dataverse = DataverseConfig::from_env()?;
//!
//!     let tokens = dataverse.token_provider(reqwest::Client::new())?;
//!     let runner = PipelineRunner::new(
//!         Arc::new(XmlaClient::new(&xmla)?),
//!         Arc::new(DataverseClient::new(&dataverse, tokens)?),
//!     )
//!     .with_default_catalog(xmla.catalog.clone())
//!     .with_upsert_options(sync.upsert.clone());
//!
//!     let pipelines = load_pipelines(&sync.pipelines_file)?;
//!     let report = runner.run(&pipelines["store_daily"], &HashMap::new(), false).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod dataverse;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod transform;
pub mod xmla;

pub use error::{IngestError, Result};
