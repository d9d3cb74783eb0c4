//! Configured pipelines
//!
//! A pipeline pairs an MDX query with a mapping file. [`PipelineRunner`]
//! executes it: query the cube, parse the cell set, transform rows into
//! records, upsert them. A refresh purges the table first and may reload it
//! in [`RefreshSlice`]s.

pub mod definition;
pub mod runner;
pub mod slice;

pub use definition::{load_pipelines, parse_pipelines, render_mdx_template, PipelineDefinition};
pub use runner::{CubeSource, PipelineReport, PipelineRunner, RefreshOptions, RefreshReport};
pub use slice::{with_fiscal_year, RefreshSlice};
