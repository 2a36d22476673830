//! # compliance-index
//!
//! Indexes Terraform-style infrastructure configuration by compliance
//! control and serves structured queries from a persisted, incrementally
//! invalidated cache.
//!
//! ## Architecture
//!
//! - **scan**: File discovery under the scan roots, stat and checksum passes
//! - **extract**: Resource blocks and typed attribute values from source text
//! - **mapper**: Static rule tables from resource type and attributes to control codes
//! - **snapshot**: The immutable index and its single-pass builder
//! - **persist**: Versioned, checksummed, compressed cache file with atomic replace
//! - **orchestrator**: Warm, incremental and full load paths; snapshot publication
//! - **query**: Predicate algebra evaluated against the lookup maps
//! - **report**: JSON, CSV, summary and matrix rendering of query results
//! - **config**: Scan scope, cache location and the optional TOML config file
//! - **error**: Typed error kinds and per-file parse diagnostics

pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod mapper;
pub mod orchestrator;
pub mod persist;
pub mod query;
pub mod report;
pub mod scan;
pub mod snapshot;
