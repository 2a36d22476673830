//! Cache orchestration: decide whether the persisted index can be served,
//! rebuild it fully or per file when it cannot, and publish exactly one
//! immutable snapshot.
//!
//! ```text
//! Cold -> Validating -> Warm
//!                    -> Rebuilding(incremental) -> Warm
//!      -> Rebuilding(full) -> Warm
//! ```
//!
//! Publishing is a single pointer swap. A reader holding an earlier
//! `Arc<IndexSnapshot>` keeps a complete, consistent view.

use arc_swap::ArcSwapOption;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::error::{IndexError, PersistError};
use crate::extract::extract;
use crate::persist::{self, CacheLock};
use crate::scan::{self, FileRecord, FileStat};
use crate::snapshot::{IndexSnapshot, ResourceRecord, SnapshotBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Cold,
    Validating,
    Rebuilding(RebuildKind),
    Warm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FullRebuildReason {
    Forced,
    CacheMissing,
    CacheCorrupt,
    VersionMismatch,
    ConfigChanged,
}

/// Difference between a cached manifest and the current stat pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestDiff {
    pub changed: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    fn needs_extraction(&self) -> HashSet<&str> {
        self.changed
            .iter()
            .chain(self.added.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Compares by existence, mtime and size only. Content equality is left to
/// the checksum of whatever gets re-extracted.
pub fn diff_manifest(by_file: &BTreeMap<String, FileRecord>, stats: &[FileStat]) -> ManifestDiff {
    let mut diff = ManifestDiff::default();
    let mut present = HashSet::with_capacity(stats.len());

    for stat in stats {
        let key = stat.key();
        match by_file.get(&key) {
            None => diff.added.push(key.clone()),
            Some(record) if !record.matches_stat(stat) => diff.changed.push(key.clone()),
            Some(_) => {}
        }
        present.insert(key);
    }
    diff.removed = by_file
        .keys()
        .filter(|path| !present.contains(*path))
        .cloned()
        .collect();
    diff
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum LoadPath {
    Warm,
    Incremental {
        #[serde(flatten)]
        diff: ManifestDiff,
    },
    Full {
        reason: FullRebuildReason,
    },
}

/// What one `open` did, for logs and the `build` command.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    #[serde(flatten)]
    pub path: LoadPath,
    pub generation_id: u64,
    pub file_count: usize,
    pub resource_count: usize,
    pub extracted_files: usize,
    pub parse_errors: usize,
    pub integrity_checksum: String,
    pub cache_path: String,
    pub saved: bool,
    pub duration_ms: u64,
}

pub struct Orchestrator {
    config: ScanConfig,
    state: CacheState,
    transitions: Vec<CacheState>,
    current: ArcSwapOption<IndexSnapshot>,
}

impl Orchestrator {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            state: CacheState::Cold,
            transitions: vec![CacheState::Cold],
            current: ArcSwapOption::empty(),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    /// States visited since construction, starting with `Cold`.
    pub fn transitions(&self) -> &[CacheState] {
        &self.transitions
    }

    /// The published snapshot, if any.
    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.current.load_full()
    }

    /// Brings the index to `Warm` and returns the published snapshot.
    pub fn ensure_warm(&mut self) -> Result<Arc<IndexSnapshot>, IndexError> {
        if self.state == CacheState::Warm
            && let Some(snapshot) = self.snapshot()
        {
            return Ok(snapshot);
        }
        self.open(false)?;
        self.snapshot()
            .ok_or_else(|| IndexError::config("no snapshot was published"))
    }

    /// Validates the persisted index against disk and rebuilds as needed.
    pub fn open(&mut self, force_rebuild: bool) -> Result<LoadReport, IndexError> {
        let start = Instant::now();
        let cache_path = self.config.cache_path.clone();
        self.transition(CacheState::Cold);

        let stats = scan::stat_files(&self.config)?;

        let (path, previous) = if force_rebuild {
            (
                LoadPath::Full {
                    reason: FullRebuildReason::Forced,
                },
                None,
            )
        } else {
            self.transition(CacheState::Validating);
            match persist::load(&cache_path) {
                Ok(snapshot) if snapshot.config_fingerprint != self.config.fingerprint() => (
                    LoadPath::Full {
                        reason: FullRebuildReason::ConfigChanged,
                    },
                    None,
                ),
                Ok(snapshot) => {
                    let diff = diff_manifest(&snapshot.by_file, &stats);
                    if diff.is_empty() {
                        info!(generation = snapshot.generation_id, "index cache is warm");
                        let report = LoadReport {
                            path: LoadPath::Warm,
                            generation_id: snapshot.generation_id,
                            file_count: snapshot.file_count,
                            resource_count: snapshot.resource_count,
                            extracted_files: 0,
                            parse_errors: snapshot.parse_error_count(),
                            integrity_checksum: snapshot.integrity_checksum.clone(),
                            cache_path: cache_path.to_string_lossy().to_string(),
                            saved: false,
                            duration_ms: start.elapsed().as_millis() as u64,
                        };
                        self.publish(snapshot);
                        return Ok(report);
                    }
                    (LoadPath::Incremental { diff }, Some(snapshot))
                }
                Err(PersistError::Missing(_)) => (
                    LoadPath::Full {
                        reason: FullRebuildReason::CacheMissing,
                    },
                    None,
                ),
                Err(PersistError::Incompatible { reason, .. }) => {
                    info!(%reason, "index cache is from another version");
                    (
                        LoadPath::Full {
                            reason: FullRebuildReason::VersionMismatch,
                        },
                        None,
                    )
                }
                Err(e) => {
                    warn!(error = %e, "index cache unusable, rebuilding from scratch");
                    (
                        LoadPath::Full {
                            reason: FullRebuildReason::CacheCorrupt,
                        },
                        None,
                    )
                }
            }
        };

        let kind = match path {
            LoadPath::Incremental { .. } => RebuildKind::Incremental,
            _ => RebuildKind::Full,
        };
        self.transition(CacheState::Rebuilding(kind));
        let lock = CacheLock::acquire(&cache_path)?;

        // Another writer may have published while we waited on the lock.
        let generation_id = self.last_generation(&cache_path, previous.as_ref()) + 1;
        let (snapshot, extracted_files) = match (&path, previous) {
            (LoadPath::Incremental { diff }, Some(previous)) => {
                info!(
                    changed = diff.changed.len(),
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    "incremental rebuild"
                );
                self.rebuild_incremental(&stats, diff, &previous, generation_id)?
            }
            _ => {
                info!(files = stats.len(), ?path, "full rebuild");
                self.rebuild_full(&stats, generation_id)?
            }
        };

        let saved = match persist::save_locked(&snapshot, &cache_path, &lock) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "failed to persist index; serving in-memory snapshot");
                false
            }
        };
        drop(lock);

        let report = LoadReport {
            path,
            generation_id: snapshot.generation_id,
            file_count: snapshot.file_count,
            resource_count: snapshot.resource_count,
            extracted_files,
            parse_errors: snapshot.parse_error_count(),
            integrity_checksum: snapshot.integrity_checksum.clone(),
            cache_path: cache_path.to_string_lossy().to_string(),
            saved,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        self.publish(snapshot);
        Ok(report)
    }

    /// Newest generation on disk, in the loaded snapshot or already
    /// published by this orchestrator. Call with the cache lock held.
    fn last_generation(&self, cache_path: &Path, previous: Option<&IndexSnapshot>) -> u64 {
        let on_disk = persist::read_header(cache_path)
            .map(|h| h.generation_id)
            .unwrap_or(0);
        let loaded = previous.map_or(0, |s| s.generation_id);
        let published = self.snapshot().map_or(0, |s| s.generation_id);
        on_disk.max(loaded).max(published)
    }

    fn rebuild_full(
        &self,
        stats: &[FileStat],
        generation_id: u64,
    ) -> Result<(IndexSnapshot, usize), IndexError> {
        let processed = self.extract_files(stats.iter().collect())?;
        let count = processed.len();
        let mut builder = SnapshotBuilder::new(&self.config, generation_id);
        for (file, resources) in processed {
            builder.add_file(file, resources);
        }
        Ok((builder.build()?, count))
    }

    fn rebuild_incremental(
        &self,
        stats: &[FileStat],
        diff: &ManifestDiff,
        previous: &IndexSnapshot,
        generation_id: u64,
    ) -> Result<(IndexSnapshot, usize), IndexError> {
        let affected = diff.needs_extraction();
        let (dirty, clean): (Vec<&FileStat>, Vec<&FileStat>) = stats
            .iter()
            .partition(|s| affected.contains(s.key().as_str()));

        let processed = self.extract_files(dirty)?;
        let count = processed.len();
        let mut builder = SnapshotBuilder::new(&self.config, generation_id);
        for stat in clean {
            let key = stat.key();
            let Some(record) = previous.by_file.get(&key) else {
                continue;
            };
            let reused: Vec<Arc<ResourceRecord>> =
                previous.resources_in_file(&key).cloned().collect();
            builder.add_file(record.clone(), reused);
        }
        for (file, resources) in processed {
            builder.add_file(file, resources);
        }
        Ok((builder.build()?, count))
    }

    /// Reads and extracts files on a bounded pool. Output order follows
    /// input order regardless of which worker finishes first.
    fn extract_files(
        &self,
        stats: Vec<&FileStat>,
    ) -> Result<Vec<(FileRecord, Vec<Arc<ResourceRecord>>)>, IndexError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers.max(1))
            .build()
            .map_err(|e| IndexError::config(format!("failed to start worker pool: {e}")))?;
        Ok(pool.install(|| stats.par_iter().map(|stat| process_file(stat)).collect()))
    }

    fn publish(&mut self, snapshot: IndexSnapshot) {
        let generation = snapshot.generation_id;
        self.current.store(Some(Arc::new(snapshot)));
        self.transition(CacheState::Warm);
        debug!(generation, "published snapshot");
    }

    fn transition(&mut self, next: CacheState) {
        if next == CacheState::Cold && self.transitions.last() == Some(&CacheState::Cold) {
            self.state = next;
            return;
        }
        debug!(from = ?self.state, to = ?next, "cache state");
        self.state = next;
        self.transitions.push(next);
    }
}

fn process_file(stat: &FileStat) -> (FileRecord, Vec<Arc<ResourceRecord>>) {
    let (mut record, bytes) = scan::read_file(stat);
    let Some(bytes) = bytes else {
        return (record, Vec::new());
    };

    let extraction = extract(&bytes);
    for diagnostic in &extraction.diagnostics {
        debug!(path = %record.path, %diagnostic, "parse diagnostic");
    }
    record.parse_errors.extend(extraction.diagnostics);
    let relative = stat.relative.to_string_lossy();
    let resources = extraction
        .resources
        .into_iter()
        .map(|r| Arc::new(ResourceRecord::from_extracted(&record.path, &relative, r)))
        .collect();
    (record, resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let p = std::env::temp_dir().join(format!(
            "compliance_index_orch_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ));
        std::fs::create_dir_all(p.join("src")).unwrap();
        p
    }

    fn orchestrator(base: &Path) -> Orchestrator {
        let config = ScanConfig::new(vec![base.join("src")], base.join("cache/index.cidx"))
            .unwrap()
            .with_workers(2);
        Orchestrator::new(config)
    }

    fn write(base: &Path, name: &str, body: &str) {
        std::fs::write(base.join("src").join(name), body).unwrap();
    }

    #[test]
    fn cold_then_warm() {
        let base = temp_dir("cold_warm");
        write(&base, "a.tf", "resource \"aws_vpc\" \"main\" {}\n");

        let mut first = orchestrator(&base);
        let report = first.open(false).unwrap();
        assert_eq!(
            report.path,
            LoadPath::Full {
                reason: FullRebuildReason::CacheMissing
            }
        );
        assert_eq!(report.generation_id, 1);
        assert!(report.saved);
        assert_eq!(
            first.transitions(),
            &[
                CacheState::Cold,
                CacheState::Validating,
                CacheState::Rebuilding(RebuildKind::Full),
                CacheState::Warm
            ]
        );

        let mut second = orchestrator(&base);
        let report = second.open(false).unwrap();
        assert_eq!(report.path, LoadPath::Warm);
        assert_eq!(report.generation_id, 1);
        assert_eq!(report.extracted_files, 0);
        assert_eq!(second.state(), CacheState::Warm);
        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn incremental_rebuild_reuses_untouched_records() {
        let base = temp_dir("incremental");
        write(&base, "a.tf", "resource \"aws_vpc\" \"main\" {}\n");
        write(&base, "b.tf", "resource \"aws_kms_key\" \"k\" {}\n");
        let mut orch = orchestrator(&base);
        orch.open(false).unwrap();
        let before = orch.snapshot().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        write(&base, "b.tf", "resource \"aws_kms_key\" \"k2\" {}\n");
        write(&base, "c.tf", "resource \"aws_subnet\" \"s\" {}\n");

        let mut orch = orchestrator(&base);
        let report = orch.open(false).unwrap();
        let LoadPath::Incremental { diff } = &report.path else {
            panic!("expected incremental, got {:?}", report.path);
        };
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(report.extracted_files, 2);
        assert_eq!(report.generation_id, 2);

        let after = orch.snapshot().unwrap();
        let a_key = before.by_file.keys().find(|k| k.ends_with("a.tf")).unwrap().clone();
        let old_a: Vec<_> = before.resources_in_file(&a_key).collect();
        let new_a: Vec<_> = after.resources_in_file(&a_key).collect();
        assert_eq!(old_a, new_a);
        assert_eq!(after.resource_count, 3);
        assert_eq!(before.resource_count, 2);
        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn removed_file_drops_its_resources() {
        let base = temp_dir("removed");
        write(&base, "a.tf", "resource \"aws_vpc\" \"main\" {}\n");
        write(&base, "b.tf", "resource \"aws_kms_key\" \"k\" {}\n");
        orchestrator(&base).open(false).unwrap();

        std::fs::remove_file(base.join("src/b.tf")).unwrap();
        let mut orch = orchestrator(&base);
        let report = orch.open(false).unwrap();
        assert!(matches!(&report.path, LoadPath::Incremental { diff } if diff.removed.len() == 1));
        let snap = orch.snapshot().unwrap();
        assert_eq!(snap.file_count, 1);
        assert!(!snap.by_resource_type.contains_key("aws_kms_key"));
        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn config_change_forces_full_rebuild() {
        let base = temp_dir("config_change");
        write(&base, "a.tf", "resource \"aws_vpc\" \"main\" {}\n");
        orchestrator(&base).open(false).unwrap();

        let config = orchestrator(&base)
            .config()
            .clone()
            .with_exclude(vec!["**/skip/**".to_string()]);
        let mut orch = Orchestrator::new(config);
        let report = orch.open(false).unwrap();
        assert_eq!(
            report.path,
            LoadPath::Full {
                reason: FullRebuildReason::ConfigChanged
            }
        );
        assert_eq!(report.generation_id, 2);
        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn old_readers_keep_their_generation() {
        let base = temp_dir("readers");
        write(&base, "a.tf", "resource \"aws_vpc\" \"main\" {}\n");
        let mut orch = orchestrator(&base);
        let held = orch.ensure_warm().unwrap();

        write(&base, "b.tf", "resource \"aws_vpc\" \"other\" {}\n");
        orch.open(true).unwrap();
        let fresh = orch.snapshot().unwrap();
        assert_eq!(held.resource_count, 1);
        assert_eq!(fresh.resource_count, 2);
        assert!(fresh.generation_id > held.generation_id);
        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn waiting_writer_takes_generation_after_the_one_it_waited_for() {
        let base = temp_dir("queued_writer");
        write(&base, "a.tf", "resource \"aws_vpc\" \"main\" {}\n");
        let mut first = orchestrator(&base);
        assert_eq!(first.open(false).unwrap().generation_id, 1);

        let cache = first.config().cache_path.clone();
        let lock = CacheLock::acquire(&cache).unwrap();
        let queued = {
            let base = base.clone();
            std::thread::spawn(move || orchestrator(&base).open(true))
        };
        std::thread::sleep(Duration::from_millis(100));

        let other = SnapshotBuilder::new(first.config(), 2).build().unwrap();
        persist::save_locked(&other, &cache, &lock).unwrap();
        drop(lock);

        let report = queued.join().unwrap().unwrap();
        assert_eq!(report.generation_id, 3);
        assert!(report.saved);
        assert_eq!(persist::read_header(&cache).unwrap().generation_id, 3);
        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn generation_keeps_rising_when_saves_fail() {
        let base = temp_dir("unsaved");
        write(&base, "a.tf", "resource \"aws_vpc\" \"main\" {}\n");
        let mut orch = orchestrator(&base);
        assert_eq!(orch.open(true).unwrap().generation_id, 1);

        std::fs::remove_file(&orch.config().cache_path).unwrap();
        std::fs::create_dir_all(&orch.config().cache_path).unwrap();
        let report = orch.open(true).unwrap();
        assert!(!report.saved);
        assert_eq!(report.generation_id, 2);
        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn environment_is_classified_below_the_scan_root() {
        let base = temp_dir("env_root");
        let root = base.join("test/infra");
        std::fs::create_dir_all(root.join("prod")).unwrap();
        std::fs::write(root.join("main.tf"), "resource \"aws_vpc\" \"a\" {}\n").unwrap();
        std::fs::write(root.join("prod/main.tf"), "resource \"aws_vpc\" \"b\" {}\n").unwrap();

        let config = ScanConfig::new(vec![root], base.join("cache/index.cidx")).unwrap();
        let mut orch = Orchestrator::new(config);
        let snap = orch.ensure_warm().unwrap();
        let envs: Vec<(&str, &str)> = snap
            .order
            .iter()
            .map(|id| &snap.resources[id])
            .map(|r| (r.name.as_str(), r.environment.as_str()))
            .collect();
        assert_eq!(envs, vec![("a", "unknown"), ("b", "prod")]);
        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn missing_root_is_fatal_not_empty() {
        let base = temp_dir("missing_root");
        let config = ScanConfig::new(vec![base.join("src")], base.join("i.cidx")).unwrap();
        std::fs::remove_dir_all(base.join("src")).unwrap();
        let err = Orchestrator::new(config).open(false).err().unwrap();
        assert!(matches!(err, IndexError::Config(_)));
        let _ = std::fs::remove_dir_all(base);
    }
}
