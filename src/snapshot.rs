//! The index data model and its builder.
//!
//! An [`IndexSnapshot`] is immutable once built. Its lookup maps hold resource
//! ids only; every id they mention resolves in `resources`. `order` keeps the
//! resources sorted by (file path, name, type) so queries can return stable
//! results without sorting per call.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ScanConfig;
use crate::error::IndexError;
use crate::extract::{AttrValue, ExtractedResource};
use crate::mapper::{self, ComplianceStatus, RiskLevel, SecurityDomain};
use crate::scan::FileRecord;

pub const FORMAT_VERSION: u32 = 1;

pub type ResourceId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub file_path: String,
    pub line_start: usize,
    pub line_end: usize,
    pub attributes: BTreeMap<String, AttrValue>,
    pub security_domains: Vec<SecurityDomain>,
    pub control_codes: Vec<String>,
    pub risk_level: RiskLevel,
    pub compliance_status: ComplianceStatus,
    pub environment: String,
}

impl ResourceRecord {
    /// `relative_path` is `file_path` below its scan root; only it decides
    /// the environment.
    pub fn from_extracted(
        file_path: &str,
        relative_path: &str,
        extracted: ExtractedResource,
    ) -> Self {
        let annotation = mapper::annotate(&extracted.resource_type, &extracted.attributes);
        Self {
            id: resource_id(file_path, &extracted.resource_type, &extracted.name),
            environment: mapper::environment_for_path(relative_path).to_string(),
            resource_type: extracted.resource_type,
            name: extracted.name,
            file_path: file_path.to_string(),
            line_start: extracted.line_start,
            line_end: extracted.line_end,
            attributes: extracted.attributes,
            security_domains: annotation.security_domains,
            control_codes: annotation.control_codes,
            risk_level: annotation.risk_level,
            compliance_status: annotation.compliance_status,
        }
    }

    /// Terraform address, e.g. `aws_s3_bucket.logs`.
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }

    fn sort_key(&self) -> (&str, &str, &str) {
        (&self.file_path, &self.name, &self.resource_type)
    }
}

/// Stable across rebuilds for the same declaration.
pub fn resource_id(file_path: &str, resource_type: &str, name: &str) -> ResourceId {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(resource_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub version: u32,
    pub rule_table_version: u32,
    pub generation_id: u64,
    /// Unix seconds.
    pub created_at: u64,
    pub source_roots: Vec<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub config_fingerprint: String,
    pub file_count: usize,
    pub resource_count: usize,
    pub by_control: BTreeMap<String, BTreeSet<ResourceId>>,
    pub by_resource_type: BTreeMap<String, BTreeSet<ResourceId>>,
    pub by_security_domain: BTreeMap<String, BTreeSet<ResourceId>>,
    pub by_file: BTreeMap<String, FileRecord>,
    pub resources: BTreeMap<ResourceId, Arc<ResourceRecord>>,
    pub order: Vec<ResourceId>,
    pub integrity_checksum: String,
    #[serde(skip)]
    rank: HashMap<ResourceId, usize>,
    /// Top-level attribute key to the resources that set it.
    #[serde(skip)]
    by_attribute_key: HashMap<String, BTreeSet<ResourceId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlCoverage {
    pub control: String,
    pub resources: usize,
    pub compliant: usize,
    pub compliance_rate: f64,
}

impl IndexSnapshot {
    pub fn resource(&self, id: &str) -> Option<&Arc<ResourceRecord>> {
        self.resources.get(id)
    }

    /// Position of `id` in the stable result order.
    pub fn rank(&self, id: &str) -> Option<usize> {
        self.rank.get(id).copied()
    }

    /// Resources that set attribute `key` at the top level.
    pub fn with_attribute_key(&self, key: &str) -> Option<&BTreeSet<ResourceId>> {
        self.by_attribute_key.get(key)
    }

    /// Resources declared in `path`, in stable order.
    pub fn resources_in_file<'a>(
        &'a self,
        path: &'a str,
    ) -> impl Iterator<Item = &'a Arc<ResourceRecord>> + 'a {
        let start = self.order.partition_point(|id| {
            self.resources
                .get(id)
                .is_some_and(|r| r.file_path.as_str() < path)
        });
        self.order[start..]
            .iter()
            .filter_map(|id| self.resources.get(id))
            .take_while(move |r| r.file_path == path)
    }

    pub fn parse_error_count(&self) -> usize {
        self.by_file.values().map(|f| f.parse_errors.len()).sum()
    }

    pub fn control_coverage(&self) -> Vec<ControlCoverage> {
        self.by_control
            .iter()
            .map(|(control, ids)| {
                let compliant = ids
                    .iter()
                    .filter_map(|id| self.resources.get(id))
                    .filter(|r| r.compliance_status == ComplianceStatus::Compliant)
                    .count();
                ControlCoverage {
                    control: control.clone(),
                    resources: ids.len(),
                    compliant,
                    compliance_rate: ratio(compliant, ids.len()),
                }
            })
            .collect()
    }

    /// Share of resources with at least one control code.
    pub fn control_coverage_rate(&self) -> f64 {
        let covered = self
            .resources
            .values()
            .filter(|r| !r.control_codes.is_empty())
            .count();
        ratio(covered, self.resources.len())
    }

    /// Recomputes the content checksum. File mtimes are not part of it.
    pub fn compute_checksum(&self) -> Result<String, IndexError> {
        content_checksum(
            self.by_file.values(),
            self.order.iter().filter_map(|id| self.resources.get(id)),
        )
    }

    /// Verifies the invariants a loaded snapshot must satisfy before use.
    pub fn check_integrity(&self) -> Result<(), String> {
        for (label, map) in [
            ("by_control", &self.by_control),
            ("by_resource_type", &self.by_resource_type),
            ("by_security_domain", &self.by_security_domain),
        ] {
            for (key, ids) in map {
                if let Some(id) = ids.iter().find(|id| !self.resources.contains_key(*id)) {
                    return Err(format!("{label}[{key}] references missing resource {id}"));
                }
            }
        }

        if self.order.len() != self.resources.len() {
            return Err(format!(
                "order lists {} resources but {} are stored",
                self.order.len(),
                self.resources.len()
            ));
        }
        for id in &self.order {
            let Some(record) = self.resources.get(id) else {
                return Err(format!("order references missing resource {id}"));
            };
            if record.id != *id {
                return Err(format!("resource stored under {id} has id {}", record.id));
            }
            if !self.by_file.contains_key(&record.file_path) {
                return Err(format!("resource {id} belongs to unindexed file {}", record.file_path));
            }
        }

        if self.file_count != self.by_file.len() || self.resource_count != self.resources.len() {
            return Err("aggregate counts do not match contents".to_string());
        }

        let checksum = self.compute_checksum().map_err(|e| e.to_string())?;
        if checksum != self.integrity_checksum {
            return Err(format!(
                "integrity checksum mismatch: stored {}, computed {checksum}",
                self.integrity_checksum
            ));
        }
        Ok(())
    }

    /// Rebuilds the lookup tables that are not persisted. Called after
    /// deserialization.
    pub fn restore_derived(&mut self) {
        self.rank = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut by_attribute_key: HashMap<String, BTreeSet<ResourceId>> = HashMap::new();
        for record in self.resources.values() {
            for key in record.attributes.keys() {
                by_attribute_key
                    .entry(key.clone())
                    .or_default()
                    .insert(record.id.clone());
            }
        }
        self.by_attribute_key = by_attribute_key;
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn content_checksum<'a>(
    files: impl Iterator<Item = &'a FileRecord>,
    resources: impl Iterator<Item = &'a Arc<ResourceRecord>>,
) -> Result<String, IndexError> {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.checksum.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.resource_count.to_le_bytes());
    }
    for record in resources {
        serde_json::to_writer(&mut hasher, record.as_ref())?;
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Scratch space for one generation. Nothing is visible until [`build`]
/// returns a complete snapshot.
///
/// [`build`]: SnapshotBuilder::build
pub struct SnapshotBuilder {
    generation_id: u64,
    source_roots: Vec<String>,
    include: Vec<String>,
    exclude: Vec<String>,
    config_fingerprint: String,
    files: Vec<FileRecord>,
    resources: Vec<Arc<ResourceRecord>>,
}

impl SnapshotBuilder {
    pub fn new(config: &ScanConfig, generation_id: u64) -> Self {
        Self {
            generation_id,
            source_roots: config.root_strings(),
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            config_fingerprint: config.fingerprint(),
            files: Vec::new(),
            resources: Vec::new(),
        }
    }

    /// Adds one file and the resources declared in it. Resources may be
    /// shared with an earlier generation.
    pub fn add_file(&mut self, mut file: FileRecord, resources: Vec<Arc<ResourceRecord>>) {
        file.resource_count = resources.len();
        self.files.push(file);
        self.resources.extend(resources);
    }

    pub fn build(mut self) -> Result<IndexSnapshot, IndexError> {
        self.files.sort_by(|a, b| a.path.cmp(&b.path));
        self.files.dedup_by(|a, b| a.path == b.path);
        self.resources.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut by_control: BTreeMap<String, BTreeSet<ResourceId>> = BTreeMap::new();
        let mut by_resource_type: BTreeMap<String, BTreeSet<ResourceId>> = BTreeMap::new();
        let mut by_security_domain: BTreeMap<String, BTreeSet<ResourceId>> = BTreeMap::new();
        let mut resources = BTreeMap::new();
        let mut order = Vec::with_capacity(self.resources.len());

        for record in self.resources {
            if resources.contains_key(&record.id) {
                continue;
            }
            for code in &record.control_codes {
                by_control.entry(code.clone()).or_default().insert(record.id.clone());
            }
            by_resource_type
                .entry(record.resource_type.clone())
                .or_default()
                .insert(record.id.clone());
            for domain in &record.security_domains {
                by_security_domain
                    .entry(domain.as_str().to_string())
                    .or_default()
                    .insert(record.id.clone());
            }
            order.push(record.id.clone());
            resources.insert(record.id.clone(), record);
        }

        let by_file: BTreeMap<String, FileRecord> =
            self.files.into_iter().map(|f| (f.path.clone(), f)).collect();
        let integrity_checksum = content_checksum(
            by_file.values(),
            order.iter().filter_map(|id| resources.get(id)),
        )?;

        let mut snapshot = IndexSnapshot {
            version: FORMAT_VERSION,
            rule_table_version: mapper::RULE_TABLE_VERSION,
            generation_id: self.generation_id,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            source_roots: self.source_roots,
            include: self.include,
            exclude: self.exclude,
            config_fingerprint: self.config_fingerprint,
            file_count: by_file.len(),
            resource_count: resources.len(),
            by_control,
            by_resource_type,
            by_security_domain,
            by_file,
            resources,
            order,
            integrity_checksum,
            rank: HashMap::new(),
            by_attribute_key: HashMap::new(),
        };
        snapshot.restore_derived();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract;

    fn config() -> ScanConfig {
        let root = std::env::temp_dir();
        ScanConfig::new(vec![root.clone()], root.join("unused.cidx")).unwrap()
    }

    fn file(path: &str, src: &str) -> (FileRecord, Vec<Arc<ResourceRecord>>) {
        let out = extract(src.as_bytes());
        let record = FileRecord {
            path: path.to_string(),
            checksum: crate::scan::hash_bytes(src.as_bytes()),
            modified_at: 1,
            size: src.len() as u64,
            resource_count: 0,
            parse_errors: out.diagnostics,
        };
        let resources = out
            .resources
            .into_iter()
            .map(|r| Arc::new(ResourceRecord::from_extracted(path, path, r)))
            .collect();
        (record, resources)
    }

    fn build(files: Vec<(FileRecord, Vec<Arc<ResourceRecord>>)>) -> IndexSnapshot {
        let mut builder = SnapshotBuilder::new(&config(), 1);
        for (f, r) in files {
            builder.add_file(f, r);
        }
        builder.build().unwrap()
    }

    const STORAGE: &str = r#"
resource "aws_s3_bucket" "b" {
  server_side_encryption_configuration {
    rule {}
  }
}
resource "aws_s3_bucket" "a" {}
"#;
    const NETWORK: &str = r#"
resource "aws_vpc" "main" {}
"#;

    #[test]
    fn builder_indexes_every_resource_and_orders_by_path_then_name() {
        let snap = build(vec![file("/r/z/net.tf", NETWORK), file("/r/a/storage.tf", STORAGE)]);
        assert_eq!(snap.file_count, 2);
        assert_eq!(snap.resource_count, 3);
        let names: Vec<String> = snap.order.iter().map(|id| snap.resources[id].address()).collect();
        assert_eq!(names, vec!["aws_s3_bucket.a", "aws_s3_bucket.b", "aws_vpc.main"]);
        assert_eq!(snap.by_control["CC6.8"].len(), 1);
        assert_eq!(snap.by_resource_type["aws_s3_bucket"].len(), 2);
        assert_eq!(snap.by_security_domain["network"].len(), 1);
        assert_eq!(snap.by_file["/r/a/storage.tf"].resource_count, 2);
        assert_eq!(snap.rank(&snap.order[2]), Some(2));
        snap.check_integrity().unwrap();
    }

    #[test]
    fn checksum_ignores_mtime_and_build_order() {
        let a = build(vec![file("/r/a.tf", STORAGE), file("/r/b.tf", NETWORK)]);
        assert_eq!(a.compute_checksum().unwrap(), a.integrity_checksum);
        let (mut touched, resources) = file("/r/a.tf", STORAGE);
        touched.modified_at = 99;
        let b = build(vec![file("/r/b.tf", NETWORK), (touched, resources)]);
        assert_eq!(a.integrity_checksum, b.integrity_checksum);

        let c = build(vec![file("/r/a.tf", STORAGE)]);
        assert_ne!(a.integrity_checksum, c.integrity_checksum);
    }

    #[test]
    fn resources_in_file_walks_one_file() {
        let snap = build(vec![
            file("/r/a.tf", STORAGE),
            file("/r/b.tf", NETWORK),
            file("/r/c.tf", ""),
        ]);
        assert_eq!(snap.resources_in_file("/r/a.tf").count(), 2);
        assert_eq!(snap.resources_in_file("/r/b.tf").count(), 1);
        assert_eq!(snap.resources_in_file("/r/c.tf").count(), 0);
        assert_eq!(snap.resources_in_file("/r/zz.tf").count(), 0);
    }

    #[test]
    fn integrity_check_catches_dangling_ids() {
        let mut snap = build(vec![file("/r/a.tf", STORAGE)]);
        snap.by_control
            .entry("CC6.8".to_string())
            .or_default()
            .insert("deadbeef".to_string());
        let err = snap.check_integrity().unwrap_err();
        assert!(err.contains("missing resource deadbeef"), "{err}");
    }

    #[test]
    fn content_checksum_is_sha256_of_canonical_stream() {
        let snap = build(vec![file("/r/a.tf", NETWORK)]);
        let file = &snap.by_file["/r/a.tf"];
        let record = &snap.resources[&snap.order[0]];

        let mut stream = Vec::new();
        stream.extend_from_slice(file.path.as_bytes());
        stream.push(0);
        stream.extend_from_slice(file.checksum.as_bytes());
        stream.push(0);
        stream.extend_from_slice(&file.resource_count.to_le_bytes());
        stream.extend_from_slice(&serde_json::to_vec(record.as_ref()).unwrap());
        stream.push(b'\n');
        assert_eq!(snap.integrity_checksum, crate::scan::hash_bytes(&stream));
    }

    #[test]
    fn environment_ignores_directories_above_the_root() {
        let out = extract(NETWORK.as_bytes());
        let resource = out.resources.into_iter().next().unwrap();
        let nested = ResourceRecord::from_extracted(
            "/home/ci/test/infra/main.tf",
            "main.tf",
            resource.clone(),
        );
        assert_eq!(nested.environment, "unknown");
        let prod = ResourceRecord::from_extracted(
            "/home/ci/test/infra/prod/main.tf",
            "prod/main.tf",
            resource,
        );
        assert_eq!(prod.environment, "prod");
    }

    #[test]
    fn ids_are_stable_and_distinct() {
        assert_eq!(
            resource_id("/r/a.tf", "aws_vpc", "main"),
            resource_id("/r/a.tf", "aws_vpc", "main")
        );
        assert_ne!(
            resource_id("/r/a.tf", "aws_vpc", "main"),
            resource_id("/r/b.tf", "aws_vpc", "main")
        );
    }

    #[test]
    fn coverage_counts_compliant_resources() {
        let snap = build(vec![file("/r/a.tf", STORAGE)]);
        let cc68 = snap
            .control_coverage()
            .into_iter()
            .find(|c| c.control == "CC6.8")
            .unwrap();
        assert_eq!((cc68.resources, cc68.compliant), (1, 1));
        assert!(snap.control_coverage_rate() > 0.99);
    }
}
