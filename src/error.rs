//! Error kinds shared across the indexer.
//!
//! Structural failures (bad scan roots, unreadable cache files, malformed
//! queries) are typed errors. Per-file extraction problems are not errors at
//! all: they are recorded as [`ParseDiagnostic`]s on the owning file record.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Fatal problems with the scan scope or the cache location.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A configured scan root is missing, not a directory, or the glob set is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to acquire lock on {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize index: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cache header is {len} bytes, above the {limit} byte limit")]
    HeaderTooLarge { len: usize, limit: u32 },

    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl IndexError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures reading or writing the on-disk cache file.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no cache file at {0}")]
    Missing(PathBuf),

    /// Bad magic, undecodable header or payload, checksum mismatch, or a
    /// dangling resource id. The file must not be trusted.
    #[error("cache file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Written by a build with a different format or rule table.
    #[error("cache file {path} is incompatible: {reason}")]
    Incompatible { path: PathBuf, reason: String },

    #[error("i/o error on cache file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

const QUERY_FIELDS: &str = "control, type, domain, attribute, risk, status, environment, file";

/// A query could not be constructed. Fatal to that call only.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown query field '{0}' (expected one of: {fields})", fields = QUERY_FIELDS)]
    UnknownField(String),

    #[error("filter '{0}' is missing a value (expected field=value)")]
    MissingValue(String),

    #[error("invalid value '{value}' for field '{field}'")]
    InvalidValue { field: String, value: String },

    #[error("query has no predicates")]
    Empty,
}

/// A non-fatal extraction issue attributed to a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseDiagnostic {
    pub line: Option<usize>,
    pub message: String,
}

impl ParseDiagnostic {
    pub fn new(line: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParseDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}
