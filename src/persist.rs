//! On-disk cache file.
//!
//! Layout: `CIDX` magic, a little-endian `u32` header length, a JSON
//! [`CacheHeader`], then the gzip-compressed JSON snapshot. The header is
//! enough for `status`; loading always verifies the payload checksum, the
//! snapshot's integrity checksum and its referential invariants, and reports
//! any failure as corruption.
//!
//! Writers hold an exclusive [`CacheLock`] on `<cache>.lock`, write
//! `<cache>.tmp`, fsync it, and rename it over the cache file.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use fs2::FileExt;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

use crate::config::{lock_path, temp_path};
use crate::error::{IndexError, PersistError};
use crate::mapper::RULE_TABLE_VERSION;
use crate::scan::hash_bytes;
use crate::snapshot::{FORMAT_VERSION, IndexSnapshot};

const MAGIC: &[u8; 4] = b"CIDX";
const MAX_HEADER_LEN: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHeader {
    pub format_version: u32,
    pub rule_table_version: u32,
    pub generation_id: u64,
    pub created_at: u64,
    pub file_count: usize,
    pub resource_count: usize,
    pub config_fingerprint: String,
    pub integrity_checksum: String,
    /// sha256 of the compressed payload bytes.
    pub payload_checksum: String,
}

impl CacheHeader {
    fn for_snapshot(snapshot: &IndexSnapshot, payload: &[u8]) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            rule_table_version: RULE_TABLE_VERSION,
            generation_id: snapshot.generation_id,
            created_at: snapshot.created_at,
            file_count: snapshot.file_count,
            resource_count: snapshot.resource_count,
            config_fingerprint: snapshot.config_fingerprint.clone(),
            integrity_checksum: snapshot.integrity_checksum.clone(),
            payload_checksum: hash_bytes(payload),
        }
    }

    /// Whether this binary can read the payload at all.
    pub fn incompatibility(&self) -> Option<String> {
        if self.format_version != FORMAT_VERSION {
            return Some(format!(
                "format version {} (expected {FORMAT_VERSION})",
                self.format_version
            ));
        }
        if self.rule_table_version != RULE_TABLE_VERSION {
            return Some(format!(
                "rule table version {} (expected {RULE_TABLE_VERSION})",
                self.rule_table_version
            ));
        }
        None
    }
}

/// Exclusive advisory lock scoped to one cache location. Released on drop.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    pub fn acquire(cache_path: &Path) -> Result<Self, IndexError> {
        let path = lock_path(cache_path);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| IndexError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| IndexError::io(&path, e))?;
        file.lock_exclusive().map_err(|source| IndexError::Lock {
            path: path.clone(),
            source,
        })?;
        debug!(lock = %path.display(), "acquired cache lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Acquires the cache lock and writes `snapshot` atomically.
pub fn save(snapshot: &IndexSnapshot, cache_path: &Path) -> Result<PathBuf, IndexError> {
    let lock = CacheLock::acquire(cache_path)?;
    save_locked(snapshot, cache_path, &lock)
}

/// Writes `snapshot` while the caller already holds the cache lock.
pub fn save_locked(
    snapshot: &IndexSnapshot,
    cache_path: &Path,
    _lock: &CacheLock,
) -> Result<PathBuf, IndexError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, snapshot)?;
    let payload = encoder.finish().map_err(|e| IndexError::io(cache_path, e))?;

    let header = serde_json::to_vec(&CacheHeader::for_snapshot(snapshot, &payload))?;
    let header_len = u32::try_from(header.len())
        .ok()
        .filter(|len| *len <= MAX_HEADER_LEN)
        .ok_or(IndexError::HeaderTooLarge {
            len: header.len(),
            limit: MAX_HEADER_LEN,
        })?;

    let tmp = temp_path(cache_path);
    {
        let mut file = File::create(&tmp).map_err(|e| IndexError::io(&tmp, e))?;
        let write = |file: &mut File| -> std::io::Result<()> {
            file.write_all(MAGIC)?;
            file.write_all(&header_len.to_le_bytes())?;
            file.write_all(&header)?;
            file.write_all(&payload)?;
            file.flush()?;
            file.sync_all()
        };
        write(&mut file).map_err(|e| IndexError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, cache_path).map_err(|e| IndexError::io(cache_path, e))?;

    info!(
        path = %cache_path.display(),
        generation = snapshot.generation_id,
        resources = snapshot.resource_count,
        bytes = payload.len(),
        "saved index"
    );
    Ok(cache_path.to_path_buf())
}

/// Loads and fully verifies a snapshot.
pub fn load(cache_path: &Path) -> Result<IndexSnapshot, PersistError> {
    let file = open_cache(cache_path)?;
    let len = file
        .metadata()
        .map_err(|source| PersistError::Io {
            path: cache_path.to_path_buf(),
            source,
        })?
        .len();
    if len < 8 {
        return Err(PersistError::corrupt(cache_path, "file is truncated"));
    }

    // SAFETY: the cache file is only replaced by rename, never rewritten in place.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|source| PersistError::Io {
        path: cache_path.to_path_buf(),
        source,
    })?;
    decode(cache_path, &mmap)
}

fn decode(cache_path: &Path, bytes: &[u8]) -> Result<IndexSnapshot, PersistError> {
    let (header, payload) = split_header(cache_path, bytes)?;
    if let Some(reason) = header.incompatibility() {
        return Err(PersistError::Incompatible {
            path: cache_path.to_path_buf(),
            reason,
        });
    }

    if hash_bytes(payload) != header.payload_checksum {
        return Err(PersistError::corrupt(cache_path, "payload checksum mismatch"));
    }

    let mut snapshot: IndexSnapshot = serde_json::from_reader(GzDecoder::new(payload))
        .map_err(|e| PersistError::corrupt(cache_path, format!("payload does not decode: {e}")))?;

    if snapshot.integrity_checksum != header.integrity_checksum
        || snapshot.generation_id != header.generation_id
        || snapshot.version != header.format_version
    {
        return Err(PersistError::corrupt(cache_path, "header does not match payload"));
    }
    snapshot
        .check_integrity()
        .map_err(|reason| PersistError::corrupt(cache_path, reason))?;
    snapshot.restore_derived();

    debug!(
        path = %cache_path.display(),
        generation = snapshot.generation_id,
        resources = snapshot.resource_count,
        "loaded index"
    );
    Ok(snapshot)
}

fn split_header<'a>(
    cache_path: &Path,
    bytes: &'a [u8],
) -> Result<(CacheHeader, &'a [u8]), PersistError> {
    if bytes.len() < 8 || &bytes[..4] != MAGIC {
        return Err(PersistError::corrupt(cache_path, "bad magic"));
    }
    let header_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if header_len > MAX_HEADER_LEN {
        return Err(PersistError::corrupt(cache_path, "header length out of range"));
    }
    let end = 8 + header_len as usize;
    let Some(raw) = bytes.get(8..end) else {
        return Err(PersistError::corrupt(cache_path, "file is truncated"));
    };
    let header: CacheHeader = serde_json::from_slice(raw)
        .map_err(|e| PersistError::corrupt(cache_path, format!("header does not decode: {e}")))?;
    Ok((header, &bytes[end..]))
}

fn open_cache(cache_path: &Path) -> Result<File, PersistError> {
    File::open(cache_path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            PersistError::Missing(cache_path.to_path_buf())
        } else {
            PersistError::Io {
                path: cache_path.to_path_buf(),
                source,
            }
        }
    })
}

/// Cheap description of the cache file for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub path: String,
    pub exists: bool,
    pub size_bytes: u64,
    pub age_secs: Option<u64>,
    pub header: Option<CacheHeader>,
    pub compatible: bool,
    pub error: Option<String>,
}

/// Reads the header only; the payload is not decompressed.
pub fn inspect(cache_path: &Path) -> CacheInfo {
    let mut info = CacheInfo {
        path: cache_path.to_string_lossy().to_string(),
        exists: false,
        size_bytes: 0,
        age_secs: None,
        header: None,
        compatible: false,
        error: None,
    };

    let Ok(meta) = cache_path.metadata() else {
        return info;
    };
    info.exists = true;
    info.size_bytes = meta.len();
    info.age_secs = meta
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .map(|d| d.as_secs());

    match read_header(cache_path) {
        Ok(header) => {
            info.compatible = header.incompatibility().is_none();
            info.header = Some(header);
        }
        Err(e) => info.error = Some(e.to_string()),
    }
    info
}

pub fn read_header(cache_path: &Path) -> Result<CacheHeader, PersistError> {
    let file = open_cache(cache_path)?;
    let mut reader = BufReader::new(file);
    let mut prefix = [0u8; 8];
    reader
        .read_exact(&mut prefix)
        .map_err(|_| PersistError::corrupt(cache_path, "file is truncated"))?;
    if &prefix[..4] != MAGIC {
        return Err(PersistError::corrupt(cache_path, "bad magic"));
    }
    let header_len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
    if header_len > MAX_HEADER_LEN {
        return Err(PersistError::corrupt(cache_path, "header length out of range"));
    }
    let mut raw = vec![0u8; header_len as usize];
    reader
        .read_exact(&mut raw)
        .map_err(|_| PersistError::corrupt(cache_path, "file is truncated"))?;
    serde_json::from_slice(&raw)
        .map_err(|e| PersistError::corrupt(cache_path, format!("header does not decode: {e}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub path: String,
    pub valid: bool,
    pub generation_id: Option<u64>,
    pub checks: Vec<ValidationCheck>,
    /// Indexed files that no longer exist on disk. Informational only.
    pub missing_source_files: Vec<String>,
}

/// Full load plus metadata consistency checks, for `validate`.
pub fn validate(cache_path: &Path) -> ValidationReport {
    let mut report = ValidationReport {
        path: cache_path.to_string_lossy().to_string(),
        valid: false,
        generation_id: None,
        checks: Vec::new(),
        missing_source_files: Vec::new(),
    };

    let header = match read_header(cache_path) {
        Ok(h) => {
            report.checks.push(check("header", true, "readable"));
            h
        }
        Err(e) => {
            report.checks.push(check("header", false, e.to_string()));
            return report;
        }
    };

    match header.incompatibility() {
        None => report.checks.push(check(
            "version",
            true,
            format!("format {FORMAT_VERSION}, rule table {RULE_TABLE_VERSION}"),
        )),
        Some(reason) => {
            report.checks.push(check("version", false, reason));
            return report;
        }
    }

    let snapshot = match load(cache_path) {
        Ok(s) => {
            let detail = format!("checksum {}", s.integrity_checksum);
            report.checks.push(check("integrity", true, detail));
            s
        }
        Err(e) => {
            report.checks.push(check("integrity", false, e.to_string()));
            return report;
        }
    };

    let consistent = header.file_count == snapshot.file_count
        && header.resource_count == snapshot.resource_count;
    report.checks.push(check(
        "metadata",
        consistent,
        format!("{} files, {} resources", snapshot.file_count, snapshot.resource_count),
    ));

    report.missing_source_files = snapshot
        .by_file
        .keys()
        .filter(|p| !Path::new(p).exists())
        .cloned()
        .collect();
    report.generation_id = Some(snapshot.generation_id);
    report.valid = report.checks.iter().all(|c| c.passed);
    report
}

fn check(name: &'static str, passed: bool, detail: impl Into<String>) -> ValidationCheck {
    ValidationCheck {
        name,
        passed,
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::extract::extract;
    use crate::scan::FileRecord;
    use crate::snapshot::{ResourceRecord, SnapshotBuilder};
    use std::sync::Arc;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let p = std::env::temp_dir().join(format!(
            "compliance_index_persist_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    fn snapshot(dir: &Path) -> IndexSnapshot {
        let config = ScanConfig::new(vec![dir.to_path_buf()], dir.join("index.cidx")).unwrap();
        let src = concat!(
            "resource \"aws_kms_key\" \"k\" {\n  enable_key_rotation = true\n}\n",
            "resource \"aws_vpc\" \"v\" {}\n",
        );
        let path = dir.join("main.tf").to_string_lossy().to_string();
        let resources = extract(src.as_bytes())
            .resources
            .into_iter()
            .map(|r| Arc::new(ResourceRecord::from_extracted(&path, "main.tf", r)))
            .collect();
        let mut builder = SnapshotBuilder::new(&config, 4);
        builder.add_file(
            FileRecord {
                path: path.clone(),
                checksum: hash_bytes(src.as_bytes()),
                modified_at: 0,
                size: src.len() as u64,
                resource_count: 0,
                parse_errors: Vec::new(),
            },
            resources,
        );
        builder.build().unwrap()
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = temp_dir("round_trip");
        let cache = dir.join("index.cidx");
        let snap = snapshot(&dir);
        save(&snap, &cache).unwrap();
        assert!(!temp_path(&cache).exists());

        let loaded = load(&cache).unwrap();
        assert_eq!(loaded, snap);
        assert_eq!(loaded.rank(&snap.order[1]), Some(1));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn flipped_payload_byte_is_corruption() {
        let dir = temp_dir("flip");
        let cache = dir.join("index.cidx");
        save(&snapshot(&dir), &cache).unwrap();

        let mut bytes = std::fs::read(&cache).unwrap();
        let last = bytes.len() - 10;
        bytes[last] ^= 0xff;
        std::fs::write(&cache, &bytes).unwrap();

        let err = load(&cache).unwrap_err();
        assert!(err.is_corrupt(), "{err}");
        assert!(!validate(&cache).valid);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn garbage_and_missing_files() {
        let dir = temp_dir("garbage");
        let cache = dir.join("index.cidx");
        assert!(matches!(load(&cache), Err(PersistError::Missing(_))));
        assert!(!inspect(&cache).exists);

        std::fs::write(&cache, b"not an index at all").unwrap();
        assert!(load(&cache).unwrap_err().is_corrupt());
        let info = inspect(&cache);
        assert!(info.exists && info.header.is_none() && info.error.is_some());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn inspect_reads_header_without_payload() {
        let dir = temp_dir("inspect");
        let cache = dir.join("index.cidx");
        let snap = snapshot(&dir);
        save(&snap, &cache).unwrap();

        let info = inspect(&cache);
        let header = info.header.unwrap();
        assert!(info.compatible);
        assert_eq!(header.generation_id, 4);
        assert_eq!(header.resource_count, 2);
        assert_eq!(header.integrity_checksum, snap.integrity_checksum);

        let report = validate(&cache);
        assert!(report.valid, "{:?}", report.checks);
        assert_eq!(report.missing_source_files.len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn oversized_header_is_not_a_config_error() {
        let dir = temp_dir("big_header");
        let cache = dir.join("index.cidx");
        let mut snap = snapshot(&dir);
        snap.config_fingerprint = "f".repeat(MAX_HEADER_LEN as usize + 1);

        let err = save(&snap, &cache).unwrap_err();
        assert!(
            matches!(err, IndexError::HeaderTooLarge { limit: MAX_HEADER_LEN, .. }),
            "{err}"
        );
        assert!(!cache.exists());
        assert!(!temp_path(&cache).exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn tampered_index_is_rejected_even_with_valid_encoding() {
        let dir = temp_dir("tamper");
        let cache = dir.join("index.cidx");
        let mut snap = snapshot(&dir);
        snap.by_control
            .entry("CC6.8".to_string())
            .or_default()
            .insert("0000".to_string());
        save(&snap, &cache).unwrap();
        assert!(load(&cache).unwrap_err().is_corrupt());
        let _ = std::fs::remove_dir_all(dir);
    }
}
