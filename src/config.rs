use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::env;
use std::path::{Path, PathBuf};

use crate::cli::Cli;
use crate::error::IndexError;

pub const DEFAULT_INCLUDE: &[&str] = &["**/*.tf"];
pub const DEFAULT_EXCLUDE: &[&str] = &["**/.terraform/**", "**/.git/**"];

const CACHE_ENV: &str = "COMPLIANCE_INDEX_CACHE";

/// Resolved scan scope and cache location for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub roots: Vec<PathBuf>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub cache_path: PathBuf,
    pub workers: usize,
}

impl ScanConfig {
    /// Validates and canonicalizes `roots`. A missing root is a configuration
    /// error, never an empty scan.
    pub fn new(roots: Vec<PathBuf>, cache_path: PathBuf) -> std::result::Result<Self, IndexError> {
        if roots.is_empty() {
            return Err(IndexError::config("no scan roots configured"));
        }

        let mut canonical = Vec::with_capacity(roots.len());
        for root in roots {
            if !root.exists() {
                return Err(IndexError::config(format!(
                    "scan root does not exist: {}",
                    root.display()
                )));
            }
            if !root.is_dir() {
                return Err(IndexError::config(format!(
                    "scan root is not a directory: {}",
                    root.display()
                )));
            }
            let resolved = root
                .canonicalize()
                .map_err(|e| IndexError::io(root.clone(), e))?;
            canonical.push(resolved);
        }
        canonical.sort();
        canonical.dedup();

        Ok(Self {
            roots: canonical,
            include: DEFAULT_INCLUDE.iter().map(|s| s.to_string()).collect(),
            exclude: DEFAULT_EXCLUDE.iter().map(|s| s.to_string()).collect(),
            cache_path,
            workers: default_workers(),
        })
    }

    pub fn with_include(mut self, include: Vec<String>) -> Self {
        if !include.is_empty() {
            self.include = include;
        }
        self
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        if !exclude.is_empty() {
            self.exclude = exclude;
        }
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Identifies the scan scope. A cache built under a different fingerprint
    /// cannot be reused incrementally.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for root in &self.roots {
            hasher.update(b"root\0");
            hasher.update(root.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        }
        for pattern in &self.include {
            hasher.update(b"include\0");
            hasher.update(pattern.as_bytes());
            hasher.update(b"\0");
        }
        for pattern in &self.exclude {
            hasher.update(b"exclude\0");
            hasher.update(pattern.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }

    pub fn root_strings(&self) -> Vec<String> {
        self.roots
            .iter()
            .map(|r| r.to_string_lossy().to_string())
            .collect()
    }
}

/// Optional `--config` file. Relative roots and cache paths are resolved
/// against the file's directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub roots: Vec<PathBuf>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub cache: Option<PathBuf>,
    pub workers: Option<usize>,
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut file: ConfigFile = toml::from_str(&raw).map_err(|e| {
        IndexError::config(format!("invalid config file {}: {e}", path.display()))
    })?;

    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    for root in file.roots.iter_mut() {
        if root.is_relative() {
            *root = base.join(&*root);
        }
    }
    if let Some(cache) = file.cache.as_mut()
        && cache.is_relative()
    {
        *cache = base.join(&*cache);
    }
    Ok(file)
}

/// CLI flags win over the config file, which wins over defaults.
pub fn resolve(cli: &Cli) -> Result<ScanConfig> {
    let file = match cli.config.as_deref() {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let roots = if !cli.roots.is_empty() {
        cli.roots.clone()
    } else if !file.roots.is_empty() {
        file.roots.clone()
    } else {
        vec![env::current_dir().context("Failed to resolve current directory")?]
    };

    let cache_path = match cli.cache.clone().or(file.cache.clone()) {
        Some(p) => p,
        None => default_cache_path()?,
    };

    let include = if cli.include.is_empty() {
        file.include
    } else {
        cli.include.clone()
    };
    let exclude = if cli.exclude.is_empty() {
        file.exclude
    } else {
        cli.exclude.clone()
    };

    let mut config = ScanConfig::new(roots, cache_path)?
        .with_include(include)
        .with_exclude(exclude);
    if let Some(workers) = cli.workers.or(file.workers) {
        config = config.with_workers(workers);
    }
    Ok(config)
}

pub fn resolve_cache_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.cache.clone() {
        return Ok(p);
    }
    if let Some(path) = cli.config.as_deref()
        && let Some(p) = load_config_file(path)?.cache
    {
        return Ok(p);
    }
    default_cache_path()
}

pub fn default_cache_path() -> Result<PathBuf> {
    if let Ok(p) = env::var(CACHE_ENV)
        && !p.is_empty()
    {
        return Ok(PathBuf::from(p));
    }
    Ok(compliance_index_home()?.join("index.cidx"))
}

pub fn temp_path(cache_path: &Path) -> PathBuf {
    sibling_with_suffix(cache_path, ".tmp")
}

pub fn lock_path(cache_path: &Path) -> PathBuf {
    sibling_with_suffix(cache_path, ".lock")
}

/// Removes the cache file together with any leftover temp and lock files.
/// Returns the paths that were actually deleted.
pub fn clear_cache(cache_path: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for (path, kind) in [
        (cache_path.to_path_buf(), "cache"),
        (temp_path(cache_path), "cache temp"),
        (lock_path(cache_path), "cache lock"),
    ] {
        if remove_file_if_exists(&path, kind)? {
            removed.push(path);
        }
    }
    Ok(removed)
}

fn compliance_index_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("compliance-index"))
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<bool> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
        return Ok(true);
    }
    Ok(false)
}
