use anyhow::{Context, Result};
use clap::Parser;
use compliance_index::cli::{Cli, Commands};
use compliance_index::config;
use compliance_index::error::{IndexError, QueryError};
use compliance_index::orchestrator::{LoadReport, Orchestrator};
use compliance_index::persist::{self, CacheInfo};
use compliance_index::query::{Composition, Query};
use compliance_index::report;
use compliance_index::snapshot::ControlCoverage;
use serde::Serialize;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;
use tracing::debug;

fn main() -> ExitCode {
    let cli = parse_cli();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn parse_cli() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    Cli::parse_from(rewrite_args_for_implicit_query(args))
}

/// `compliance-index control=CC6.8` is shorthand for `compliance-index query control=CC6.8`.
fn rewrite_args_for_implicit_query(mut args: Vec<String>) -> Vec<String> {
    if args.len() <= 1 {
        return args;
    }

    let subcommands = ["build", "status", "query", "validate", "clear", "help"];
    let valued = ["--root", "--include", "--exclude", "--cache", "--config", "--workers"];

    let mut idx = 1usize;
    while idx < args.len() {
        let a = args[idx].as_str();
        if a == "--" {
            idx += 1;
            break;
        }

        if valued.contains(&a) {
            idx += 2;
            continue;
        }

        if a.starts_with('-') {
            idx += 1;
            continue;
        }

        break;
    }

    if idx < args.len() {
        let token = args[idx].as_str();
        if !subcommands.contains(&token) && token.contains('=') {
            args.insert(idx, "query".to_string());
        }
    }

    args
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// 2 for configuration errors, 3 for malformed queries, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(IndexError::Config(_)) = cause.downcast_ref::<IndexError>() {
            return 2;
        }
        if cause.downcast_ref::<QueryError>().is_some() {
            return 3;
        }
    }
    1
}

fn run(cli: &Cli) -> Result<()> {
    match cli.command.clone() {
        Commands::Build { force } => {
            let mut orchestrator = Orchestrator::new(config::resolve(cli)?);
            let report = orchestrator.open(force)?;
            let snapshot = orchestrator.ensure_warm()?;
            let output = BuildOutput {
                report,
                control_coverage_rate: snapshot.control_coverage_rate(),
                coverage: snapshot.control_coverage(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Status => {
            let output = status(cli)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Query {
            filters,
            any,
            format,
            output,
            limit,
            force,
        } => {
            let composition = if any { Composition::Any } else { Composition::All };
            let query = Query::from_filters(&filters, composition)?;

            let mut orchestrator = Orchestrator::new(config::resolve(cli)?);
            if force {
                orchestrator.open(true)?;
            }
            let snapshot = orchestrator.ensure_warm()?;

            let start = Instant::now();
            let mut result = query.execute(&snapshot);
            debug!(
                query = %result.query,
                matches = result.len(),
                micros = start.elapsed().as_micros() as u64,
                "query executed"
            );
            if let Some(n) = limit {
                result = result.limit(n);
            }

            let content = report::render(&result, format)?;
            write_output(&content, output.as_deref())?;
        }
        Commands::Validate => {
            let cache_path = config::resolve_cache_path(cli)?;
            let report = persist::validate(&cache_path);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                anyhow::bail!("cache validation failed: {}", cache_path.display());
            }
        }
        Commands::Clear => {
            let cache_path = config::resolve_cache_path(cli)?;
            let removed = config::clear_cache(&cache_path)?;
            let output = ClearOutput {
                cache_path: cache_path.to_string_lossy().to_string(),
                removed: removed.iter().map(|p| p.to_string_lossy().to_string()).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct BuildOutput {
    #[serde(flatten)]
    report: LoadReport,
    /// Share of indexed resources that carry at least one control code.
    control_coverage_rate: f64,
    coverage: Vec<ControlCoverage>,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    cache: CacheInfo,
    roots: Vec<String>,
    include: Vec<String>,
    exclude: Vec<String>,
    config_fingerprint: String,
    /// Whether the cached index was built for this scan scope.
    config_matches: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ClearOutput {
    cache_path: String,
    removed: Vec<String>,
}

fn status(cli: &Cli) -> Result<StatusOutput> {
    let config = config::resolve(cli)?;
    let cache = persist::inspect(&config.cache_path);
    let fingerprint = config.fingerprint();
    let config_matches = cache
        .header
        .as_ref()
        .map(|h| h.config_fingerprint == fingerprint);

    Ok(StatusOutput {
        roots: config.root_strings(),
        include: config.include.clone(),
        exclude: config.exclude.clone(),
        config_fingerprint: fingerprint,
        config_matches,
        cache,
    })
}

fn write_output(content: &str, output: Option<&Path>) -> Result<()> {
    if let Some(path) = output {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
    } else {
        print!("{content}");
        if !content.ends_with('\n') {
            println!();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rewrite_args_for_implicit_query_skips_global_option_values() {
        let rewritten = rewrite_args_for_implicit_query(args(&[
            "compliance-index",
            "--root",
            "/srv/infra",
            "--cache",
            "/tmp/index.cidx",
            "-v",
            "control=CC6.8",
            "--any",
        ]));
        assert_eq!(rewritten[1], "--root");
        assert_eq!(rewritten[2], "/srv/infra");
        assert_eq!(rewritten[3], "--cache");
        assert_eq!(rewritten[4], "/tmp/index.cidx");
        assert_eq!(rewritten[5], "-v");
        assert_eq!(rewritten[6], "query");
        assert_eq!(rewritten[7], "control=CC6.8");
    }

    #[test]
    fn rewrite_args_leaves_subcommands_and_typos_alone() {
        let explicit = args(&["compliance-index", "build", "--force"]);
        assert_eq!(rewrite_args_for_implicit_query(explicit.clone()), explicit);

        let typo = args(&["compliance-index", "biuld"]);
        assert_eq!(rewrite_args_for_implicit_query(typo.clone()), typo);
    }

    #[test]
    fn exit_codes_follow_error_kind() {
        let config_err = anyhow::Error::from(IndexError::config("scan root does not exist: /nope"));
        assert_eq!(exit_code(&config_err), 2);

        let query_err = anyhow::Error::from(QueryError::Empty).context("while building query");
        assert_eq!(exit_code(&query_err), 3);

        let header_err = anyhow::Error::from(IndexError::HeaderTooLarge {
            len: 70_000,
            limit: 65_536,
        });
        assert_eq!(exit_code(&header_err), 1);

        assert_eq!(exit_code(&anyhow::anyhow!("disk full")), 1);
    }

    #[test]
    fn implicit_query_parses_into_query_command() {
        let cli = Cli::parse_from(rewrite_args_for_implicit_query(args(&[
            "compliance-index",
            "type=aws_s3_bucket",
            "risk=high",
            "-f",
            "csv",
        ])));
        match cli.command {
            Commands::Query { filters, format, .. } => {
                assert_eq!(filters, vec!["type=aws_s3_bucket", "risk=high"]);
                assert_eq!(format, report::ReportFormat::Csv);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
