//! Typed queries over a published snapshot.
//!
//! Leaf predicates backed by an index (`control`, `type`, `domain`,
//! `attribute`, exact `file`) produce candidate id sets directly. `And`
//! starts from its smallest candidate set and filters it, so its cost is
//! bounded by the smallest bucket. `Or` unions candidate sets when every
//! branch has one. Anything else falls back to a scan in stable order.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::QueryError;
use crate::mapper::{ComplianceStatus, RiskLevel, SecurityDomain};
use crate::snapshot::{IndexSnapshot, ResourceRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    ByControl(String),
    ByResourceType(String),
    BySecurityDomain(SecurityDomain),
    /// Attribute `key` is set; with `value`, it also matches that value.
    ByAttribute { key: String, value: Option<String> },
    ByRiskLevel(RiskLevel),
    ByComplianceStatus(ComplianceStatus),
    ByEnvironment(String),
    /// Exact path, or a path suffix at a separator boundary.
    ByFile(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Composition {
    All,
    Any,
}

impl Predicate {
    /// Parses one `field=value` filter.
    pub fn parse(filter: &str) -> Result<Self, QueryError> {
        let Some((field, value)) = filter.split_once('=') else {
            return Err(QueryError::MissingValue(filter.to_string()));
        };
        let field = field.trim().to_ascii_lowercase();
        let value = value.trim();
        if value.is_empty() {
            return Err(QueryError::MissingValue(filter.to_string()));
        }
        let invalid = || QueryError::InvalidValue {
            field: field.clone(),
            value: value.to_string(),
        };

        match field.as_str() {
            "control" | "control_code" => Ok(Predicate::ByControl(value.to_ascii_uppercase())),
            "type" | "resource_type" => Ok(Predicate::ByResourceType(value.to_string())),
            "domain" | "security_domain" => value
                .parse::<SecurityDomain>()
                .map(Predicate::BySecurityDomain)
                .map_err(|_| invalid()),
            "attribute" | "attr" => {
                let (key, wanted) = match value.split_once('=') {
                    Some((k, v)) => (k.trim(), Some(v.trim().to_string())),
                    None => (value, None),
                };
                if key.is_empty() {
                    return Err(invalid());
                }
                Ok(Predicate::ByAttribute {
                    key: key.to_string(),
                    value: wanted,
                })
            }
            "risk" | "risk_level" => value
                .parse::<RiskLevel>()
                .map(Predicate::ByRiskLevel)
                .map_err(|_| invalid()),
            "status" | "compliance" | "compliance_status" => value
                .parse::<ComplianceStatus>()
                .map(Predicate::ByComplianceStatus)
                .map_err(|_| invalid()),
            "environment" | "env" => Ok(Predicate::ByEnvironment(value.to_ascii_lowercase())),
            "file" | "path" => Ok(Predicate::ByFile(value.to_string())),
            _ => Err(QueryError::UnknownField(field)),
        }
    }

    pub fn matches(&self, record: &ResourceRecord) -> bool {
        match self {
            Predicate::ByControl(code) => record.control_codes.iter().any(|c| c == code),
            Predicate::ByResourceType(t) => record.resource_type == *t,
            Predicate::BySecurityDomain(d) => record.security_domains.contains(d),
            Predicate::ByAttribute { key, value } => match (record.attributes.get(key), value) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(attr), Some(wanted)) => attr.matches_str(wanted),
            },
            Predicate::ByRiskLevel(level) => record.risk_level == *level,
            Predicate::ByComplianceStatus(status) => record.compliance_status == *status,
            Predicate::ByEnvironment(env) => record.environment == *env,
            Predicate::ByFile(path) => file_matches(&record.file_path, path),
            Predicate::And(preds) => preds.iter().all(|p| p.matches(record)),
            Predicate::Or(preds) => preds.iter().any(|p| p.matches(record)),
            Predicate::Not(pred) => !pred.matches(record),
        }
    }

    /// Ids that may match, or `None` when the predicate is not index-backed.
    fn candidates<'a>(&self, snapshot: &'a IndexSnapshot) -> Option<HashSet<&'a str>> {
        match self {
            Predicate::ByControl(code) => Some(bucket(snapshot.by_control.get(code))),
            Predicate::ByResourceType(t) => Some(bucket(snapshot.by_resource_type.get(t))),
            Predicate::BySecurityDomain(d) => {
                Some(bucket(snapshot.by_security_domain.get(d.as_str())))
            }
            Predicate::ByAttribute { key, .. } => Some(bucket(snapshot.with_attribute_key(key))),
            Predicate::ByFile(path) => {
                let (key, _) = snapshot.by_file.get_key_value(path.as_str())?;
                Some(snapshot.resources_in_file(key).map(|r| r.id.as_str()).collect())
            }
            Predicate::And(preds) => preds
                .iter()
                .filter_map(|p| p.candidates(snapshot))
                .min_by_key(|set| set.len()),
            Predicate::Or(preds) => {
                let mut union = HashSet::new();
                for p in preds {
                    union.extend(p.candidates(snapshot)?);
                }
                Some(union)
            }
            _ => None,
        }
    }
}

fn bucket<'a>(ids: Option<&'a std::collections::BTreeSet<String>>) -> HashSet<&'a str> {
    ids.map(|set| set.iter().map(String::as_str).collect())
        .unwrap_or_default()
}

fn file_matches(file_path: &str, wanted: &str) -> bool {
    if file_path == wanted {
        return true;
    }
    let wanted = wanted.trim_start_matches("./");
    file_path
        .strip_suffix(wanted)
        .is_some_and(|prefix| prefix.ends_with('/') || prefix.ends_with('\\'))
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, preds: &[Predicate], sep: &str| -> fmt::Result {
            f.write_str("(")?;
            for (i, p) in preds.iter().enumerate() {
                if i > 0 {
                    write!(f, " {sep} ")?;
                }
                write!(f, "{p}")?;
            }
            f.write_str(")")
        };
        match self {
            Predicate::ByControl(c) => write!(f, "control={c}"),
            Predicate::ByResourceType(t) => write!(f, "type={t}"),
            Predicate::BySecurityDomain(d) => write!(f, "domain={d}"),
            Predicate::ByAttribute { key, value: None } => write!(f, "attribute={key}"),
            Predicate::ByAttribute {
                key,
                value: Some(v),
            } => write!(f, "attribute={key}={v}"),
            Predicate::ByRiskLevel(r) => write!(f, "risk={r}"),
            Predicate::ByComplianceStatus(s) => write!(f, "status={s}"),
            Predicate::ByEnvironment(e) => write!(f, "environment={e}"),
            Predicate::ByFile(p) => write!(f, "file={p}"),
            Predicate::And(preds) => join(f, preds, "AND"),
            Predicate::Or(preds) => join(f, preds, "OR"),
            Predicate::Not(p) => write!(f, "NOT {p}"),
        }
    }
}

/// A stateless query, built per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub predicate: Predicate,
}

impl Query {
    pub fn new(predicate: Predicate) -> Self {
        Self { predicate }
    }

    /// Builds a query from `field=value` filters combined with `composition`.
    pub fn from_filters<S: AsRef<str>>(
        filters: &[S],
        composition: Composition,
    ) -> Result<Self, QueryError> {
        let mut preds = filters
            .iter()
            .map(|f| Predicate::parse(f.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let predicate = match preds.len() {
            0 => return Err(QueryError::Empty),
            1 => preds.remove(0),
            _ => match composition {
                Composition::All => Predicate::And(preds),
                Composition::Any => Predicate::Or(preds),
            },
        };
        Ok(Self { predicate })
    }

    pub fn execute(&self, snapshot: &IndexSnapshot) -> QueryResult {
        let candidates = self.predicate.candidates(snapshot);
        let mut hits: Vec<(usize, &Arc<ResourceRecord>)> = match candidates {
            Some(ids) => ids
                .into_iter()
                .filter_map(|id| Some((snapshot.rank(id)?, snapshot.resource(id)?)))
                .filter(|(_, r)| self.predicate.matches(r))
                .collect(),
            None => snapshot
                .order
                .iter()
                .enumerate()
                .filter_map(|(i, id)| Some((i, snapshot.resource(id)?)))
                .filter(|(_, r)| self.predicate.matches(r))
                .collect(),
        };
        hits.sort_unstable_by_key(|(rank, _)| *rank);

        QueryResult {
            query: self.predicate.to_string(),
            generation_id: snapshot.generation_id,
            resources: hits.into_iter().map(|(_, r)| Arc::clone(r)).collect(),
        }
    }
}

/// Matching records in stable order (file path, then name), tagged with the
/// generation they were computed against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub generation_id: u64,
    pub resources: Vec<Arc<ResourceRecord>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.resources.truncate(n);
        self
    }

    pub fn count_by_risk(&self) -> BTreeMap<String, usize> {
        self.count_by(|r| r.risk_level.to_string())
    }

    pub fn count_by_compliance_status(&self) -> BTreeMap<String, usize> {
        self.count_by(|r| r.compliance_status.to_string())
    }

    pub fn count_by_resource_type(&self) -> BTreeMap<String, usize> {
        self.count_by(|r| r.resource_type.clone())
    }

    pub fn count_by_environment(&self) -> BTreeMap<String, usize> {
        self.count_by(|r| r.environment.clone())
    }

    fn count_by(&self, key: impl Fn(&ResourceRecord) -> String) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for r in &self.resources {
            *out.entry(key(r)).or_insert(0) += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::extract::extract;
    use crate::scan::FileRecord;
    use crate::snapshot::SnapshotBuilder;

    fn snapshot(files: &[(&str, &str)]) -> IndexSnapshot {
        let root = std::env::temp_dir();
        let config = ScanConfig::new(vec![root.clone()], root.join("unused.cidx")).unwrap();
        let mut builder = SnapshotBuilder::new(&config, 7);
        for (path, src) in files {
            let out = extract(src.as_bytes());
            let resources = out
                .resources
                .into_iter()
                .map(|r| Arc::new(ResourceRecord::from_extracted(path, path, r)))
                .collect();
            builder.add_file(
                FileRecord {
                    path: path.to_string(),
                    checksum: String::new(),
                    modified_at: 0,
                    size: 0,
                    resource_count: 0,
                    parse_errors: out.diagnostics,
                },
                resources,
            );
        }
        builder.build().unwrap()
    }

    fn fixture() -> IndexSnapshot {
        snapshot(&[
            (
                "/infra/prod/storage.tf",
                r#"
resource "aws_s3_bucket" "logs" {
  server_side_encryption_configuration {
    rule {}
  }
  versioning { enabled = true }
}
resource "aws_s3_bucket" "assets" {
  acl = "public-read"
}
"#,
            ),
            (
                "/infra/dev/db.tf",
                r#"
resource "aws_db_instance" "main" {
  storage_encrypted = true
  multi_az          = false
}
"#,
            ),
            (
                "/infra/dev/net.tf",
                r#"
resource "aws_security_group" "web" {
  ingress {
    cidr_blocks = ["0.0.0.0/0"]
  }
}
"#,
            ),
        ])
    }

    fn addresses(result: &QueryResult) -> Vec<String> {
        result.resources.iter().map(|r| r.address()).collect()
    }

    #[test]
    fn by_control_returns_resources_in_path_order() {
        let snap = fixture();
        let result = Query::new(Predicate::ByControl("CC6.8".into())).execute(&snap);
        assert_eq!(addresses(&result), vec!["aws_db_instance.main", "aws_s3_bucket.logs"]);
        assert_eq!(result.generation_id, 7);
    }

    #[test]
    fn unknown_control_is_empty_not_error() {
        let snap = fixture();
        assert!(Query::new(Predicate::ByControl("CC9.9".into())).execute(&snap).is_empty());
    }

    #[test]
    fn and_matches_brute_force() {
        let snap = fixture();
        let q = Query::from_filters(&["control=CC6.1", "type=aws_s3_bucket"], Composition::All)
            .unwrap();
        let got = q.execute(&snap);
        let expected: Vec<String> = snap
            .order
            .iter()
            .map(|id| &snap.resources[id])
            .filter(|r| {
                r.control_codes.contains(&"CC6.1".to_string()) && r.resource_type == "aws_s3_bucket"
            })
            .map(|r| r.address())
            .collect();
        assert_eq!(addresses(&got), expected);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn or_and_not_compose() {
        let snap = fixture();
        let q =
            Query::from_filters(&["domain=network", "attribute=acl"], Composition::Any).unwrap();
        assert_eq!(
            addresses(&q.execute(&snap)),
            vec!["aws_security_group.web", "aws_s3_bucket.assets"]
        );

        let q = Query::new(Predicate::And(vec![
            Predicate::ByResourceType("aws_s3_bucket".into()),
            Predicate::Not(Box::new(Predicate::ByControl("CC6.8".into()))),
        ]));
        assert_eq!(addresses(&q.execute(&snap)), vec!["aws_s3_bucket.assets"]);
    }

    #[test]
    fn attribute_value_and_non_indexed_predicates() {
        let snap = fixture();
        let q = Query::from_filters(&["attribute=multi_az=false"], Composition::All).unwrap();
        assert_eq!(addresses(&q.execute(&snap)), vec!["aws_db_instance.main"]);

        let q =
            Query::from_filters(&["environment=prod", "risk=high"], Composition::All).unwrap();
        assert_eq!(addresses(&q.execute(&snap)), vec!["aws_s3_bucket.assets"]);

        let q = Query::from_filters(&["file=dev/net.tf"], Composition::All).unwrap();
        assert_eq!(addresses(&q.execute(&snap)), vec!["aws_security_group.web"]);
        let q = Query::from_filters(&["file=/infra/dev/db.tf"], Composition::All).unwrap();
        assert_eq!(q.execute(&snap).len(), 1);
    }

    #[test]
    fn compliance_status_filter() {
        let snap = fixture();
        let q = Query::from_filters(&["status=non_compliant"], Composition::All).unwrap();
        assert_eq!(q.predicate, Predicate::ByComplianceStatus(ComplianceStatus::NonCompliant));
        assert_eq!(q.predicate.to_string(), "status=non_compliant");

        let got = addresses(&q.execute(&snap));
        let expected: Vec<String> = snap
            .order
            .iter()
            .map(|id| &snap.resources[id])
            .filter(|r| r.compliance_status == ComplianceStatus::NonCompliant)
            .map(|r| r.address())
            .collect();
        assert_eq!(got, expected);
        assert!(got.contains(&"aws_s3_bucket.assets".to_string()));
        assert!(!got.contains(&"aws_s3_bucket.logs".to_string()));

        let filters = ["compliance=compliant", "type=aws_s3_bucket"];
        let q = Query::from_filters(&filters, Composition::All).unwrap();
        assert_eq!(addresses(&q.execute(&snap)), vec!["aws_s3_bucket.logs"]);
    }

    #[test]
    fn malformed_filters_are_construction_errors() {
        assert_eq!(
            Predicate::parse("colour=red"),
            Err(QueryError::UnknownField("colour".into()))
        );
        assert!(matches!(Predicate::parse("control"), Err(QueryError::MissingValue(_))));
        for bad in ["domain=secrecy", "risk=extreme", "status=mostly"] {
            assert!(
                matches!(Predicate::parse(bad), Err(QueryError::InvalidValue { .. })),
                "{bad}"
            );
        }
        let empty: [&str; 0] = [];
        assert_eq!(Query::from_filters(&empty, Composition::All), Err(QueryError::Empty));
    }

    #[test]
    fn aggregates_and_limit() {
        let snap = fixture();
        let everything = Predicate::Not(Box::new(Predicate::ByControl("none".into())));
        let all = Query::new(everything).execute(&snap);
        assert_eq!(all.len(), 4);
        assert_eq!(all.count_by_resource_type()["aws_s3_bucket"], 2);
        assert_eq!(all.count_by_environment()["dev"], 2);
        assert_eq!(all.count_by_risk().values().sum::<usize>(), 4);
        assert_eq!(all.clone().limit(1).len(), 1);
        assert_eq!(all.query, "NOT control=none");
    }
}
