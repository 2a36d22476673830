//! File discovery for the configured scan roots.
//!
//! Two passes are exposed separately: [`stat_files`] is the cheap walk used
//! to probe a cached manifest (path, mtime, size), and [`read_file`] reads
//! and checksums one file for extraction.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::UNIX_EPOCH;
use tracing::debug;

use crate::config::ScanConfig;
use crate::error::{IndexError, ParseDiagnostic};

/// Compiled include/exclude globs, matched against root-relative paths.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl ScanFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, IndexError> {
        Ok(Self {
            include: build_glob_set(include)?,
            exclude: build_glob_set(exclude)?,
        })
    }

    pub fn from_config(config: &ScanConfig) -> Result<Self, IndexError> {
        Self::new(&config.include, &config.exclude)
    }

    pub fn matches(&self, relative: &Path) -> bool {
        self.include.is_match(relative) && !self.exclude.is_match(relative)
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet, IndexError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| IndexError::config(format!("invalid glob pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| IndexError::config(format!("failed to build glob set: {e}")))
}

/// Result of the cheap stat pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: PathBuf,
    /// Path below the scan root that found the file.
    pub relative: PathBuf,
    pub modified_at: u64,
    pub size: u64,
}

impl FileStat {
    pub fn key(&self) -> String {
        path_key(&self.path)
    }
}

/// One source file as of a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub checksum: String,
    /// Nanoseconds since the unix epoch.
    pub modified_at: u64,
    pub size: u64,
    pub resource_count: usize,
    pub parse_errors: Vec<ParseDiagnostic>,
}

impl FileRecord {
    /// Whether a fresh stat still describes this record.
    pub fn matches_stat(&self, stat: &FileStat) -> bool {
        self.modified_at == stat.modified_at && self.size == stat.size
    }
}

pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Walks every root in parallel and returns matching files in lexicographic
/// path order. Files under more than one root are reported once.
pub fn stat_files(config: &ScanConfig) -> Result<Vec<FileStat>, IndexError> {
    let filter = ScanFilter::from_config(config)?;
    let mut stats = Vec::new();

    for root in &config.roots {
        if !root.is_dir() {
            return Err(IndexError::config(format!(
                "scan root is not a directory: {}",
                root.display()
            )));
        }
        stats.extend(walk_root(root, &filter, config.workers));
    }

    stats.sort_by(|a, b| a.path.cmp(&b.path));
    stats.dedup_by(|a, b| a.path == b.path);
    debug!(files = stats.len(), roots = config.roots.len(), "stat pass complete");
    Ok(stats)
}

fn walk_root(root: &Path, filter: &ScanFilter, workers: usize) -> Vec<FileStat> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .threads(workers)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            let Ok(entry) = entry else {
                return ignore::WalkState::Continue;
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                return ignore::WalkState::Continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            if filter.matches(relative) {
                let mut stat = stat_path(path);
                stat.relative = relative.to_path_buf();
                let _ = tx.send(stat);
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    rx.iter().collect()
}

/// Metadata failures yield a zeroed stat so the file is still visited and
/// its read failure gets recorded as a diagnostic. `relative` is the full
/// path until a walk narrows it to a root.
pub fn stat_path(path: &Path) -> FileStat {
    let (modified_at, size) = match path.metadata() {
        Ok(meta) => {
            let nanos = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            (u64::try_from(nanos).unwrap_or(u64::MAX), meta.len())
        }
        Err(_) => (0, 0),
    };
    FileStat {
        path: path.to_path_buf(),
        relative: path.to_path_buf(),
        modified_at,
        size,
    }
}

/// Reads and checksums one file. Unreadable files come back with an empty
/// checksum, no contents, and a diagnostic.
pub fn read_file(stat: &FileStat) -> (FileRecord, Option<Vec<u8>>) {
    let mut record = FileRecord {
        path: stat.key(),
        checksum: String::new(),
        modified_at: stat.modified_at,
        size: stat.size,
        resource_count: 0,
        parse_errors: Vec::new(),
    };

    match std::fs::read(&stat.path) {
        Ok(bytes) => {
            record.checksum = hash_bytes(&bytes);
            record.size = bytes.len() as u64;
            (record, Some(bytes))
        }
        Err(e) => {
            debug!(path = %stat.path.display(), error = %e, "unreadable file");
            record
                .parse_errors
                .push(ParseDiagnostic::new(None, format!("failed to read file: {e}")));
            (record, None)
        }
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
