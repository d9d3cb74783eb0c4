//! XMLA transport and cell set parsing

pub mod client;
pub mod hierarchy;
pub mod parser;

pub use client::XmlaClient;
pub use hierarchy::{resolve, HierarchyMapper, HierarchyRule};
pub use parser::CellSetParser;
