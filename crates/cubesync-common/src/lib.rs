//! Cube Sync Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the cube-sync workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CubeSyncError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables
//! - **Types**: the tabular row and record model shared by the parser, transformer and engines
//!
//! # Example
//!
//! ```no_run
//! use cubesync_common::types::{CellValue, Row};
//!
//! let mut row = Row::new();
//! row.insert("StoreNumber", CellValue::text("1042"));
//! row.insert("TY Net Sales USD", CellValue::from_cell_text("1,250.50"));
//! assert!(row.get("StoreNumber").is_some());
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CubeSyncError, Result};
