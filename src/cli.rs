use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::report::ReportFormat;

#[derive(Debug, Clone, Parser)]
#[command(name = "compliance-index")]
#[command(about = "Index Terraform resources by compliance control and query a persisted cache")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory to scan. Repeatable; defaults to the current directory.
    #[arg(long = "root", value_name = "DIR", global = true)]
    pub roots: Vec<PathBuf>,

    #[arg(long, value_name = "GLOB", global = true)]
    pub include: Vec<String>,

    #[arg(long, value_name = "GLOB", global = true)]
    pub exclude: Vec<String>,

    #[arg(long, value_name = "FILE", global = true)]
    pub cache: Option<PathBuf>,

    /// TOML file with roots, include, exclude, cache and workers.
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "N", global = true)]
    pub workers: Option<usize>,

    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Build or refresh the index and print what the cache did.
    Build {
        #[arg(long)]
        force: bool,
    },
    /// Describe the persisted cache without loading its payload.
    Status,
    /// Run a query against the index, rebuilding it first if stale.
    Query {
        /// Filters as field=value: control, type, domain, attribute, risk, status,
        /// environment, file.
        #[arg(value_name = "FIELD=VALUE", required = true)]
        filters: Vec<String>,

        /// Match resources satisfying any filter instead of all of them.
        #[arg(long)]
        any: bool,

        #[arg(short = 'f', long, value_enum, default_value_t = ReportFormat::Json)]
        format: ReportFormat,

        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[arg(long, value_name = "N")]
        limit: Option<usize>,

        #[arg(long)]
        force: bool,
    },
    /// Fully load the persisted cache and check its integrity.
    Validate,
    /// Delete the cache file and its lock.
    Clear,
}
