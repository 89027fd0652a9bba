//! Storage-node log ingestion with progressive transfer rollups
//!
//! - [`ingest`] follows log sources and writes typed rows
//! - [`pipeline`] owns storage and the aggregate → promote → sweep cycle

pub mod ingest;
pub mod pipeline;
pub mod sqlite_pragma;
