//! Static control mapping.
//!
//! [`annotate`] is a pure function of a resource's type and attributes. The
//! rule tables below are the whole policy; any change to them must bump
//! [`RULE_TABLE_VERSION`] so persisted indexes built under the old rules are
//! discarded instead of reused.
//!
//! Resolution order:
//!
//! 1. The first matching type rule (exact matches are listed before prefixes).
//! 2. Every matching attribute rule, independent of type.
//! 3. If neither matched, keyword rules over the type name.
//! 4. Otherwise the resource is `uncategorized` with no control codes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::extract::AttrValue;

pub const RULE_TABLE_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityDomain {
    Encryption,
    AccessControl,
    Network,
    Backup,
    Monitoring,
    Availability,
    Uncategorized,
}

impl SecurityDomain {
    pub const ALL: [SecurityDomain; 7] = [
        SecurityDomain::Encryption,
        SecurityDomain::AccessControl,
        SecurityDomain::Network,
        SecurityDomain::Backup,
        SecurityDomain::Monitoring,
        SecurityDomain::Availability,
        SecurityDomain::Uncategorized,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SecurityDomain::Encryption => "encryption",
            SecurityDomain::AccessControl => "access_control",
            SecurityDomain::Network => "network",
            SecurityDomain::Backup => "backup",
            SecurityDomain::Monitoring => "monitoring",
            SecurityDomain::Availability => "availability",
            SecurityDomain::Uncategorized => "uncategorized",
        }
    }
}

impl fmt::Display for SecurityDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityDomain {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|d| {
                d.as_str() == normalized
                    || (normalized == "access" && *d == SecurityDomain::AccessControl)
            })
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    fn from_score(score: u32) -> Self {
        match score {
            s if s >= 5 => RiskLevel::High,
            s if s >= 3 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    PartiallyCompliant,
    NonCompliant,
    NotApplicable,
}

impl ComplianceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ComplianceStatus::Compliant => "compliant",
            ComplianceStatus::PartiallyCompliant => "partially_compliant",
            ComplianceStatus::NonCompliant => "non_compliant",
            ComplianceStatus::NotApplicable => "not_applicable",
        }
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "compliant" => Ok(ComplianceStatus::Compliant),
            "partially_compliant" | "partial" => Ok(ComplianceStatus::PartiallyCompliant),
            "non_compliant" | "noncompliant" => Ok(ComplianceStatus::NonCompliant),
            "not_applicable" | "n/a" => Ok(ComplianceStatus::NotApplicable),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub security_domains: Vec<SecurityDomain>,
    pub control_codes: Vec<String>,
    pub risk_level: RiskLevel,
    pub compliance_status: ComplianceStatus,
}

enum TypeMatch {
    Exact(&'static str),
    Prefix(&'static str),
}

impl TypeMatch {
    fn matches(&self, resource_type: &str) -> bool {
        match self {
            TypeMatch::Exact(t) => resource_type == *t,
            TypeMatch::Prefix(p) => resource_type.starts_with(p),
        }
    }
}

struct TypeRule {
    matcher: TypeMatch,
    domains: &'static [SecurityDomain],
    controls: &'static [&'static str],
}

/// Applies when any listed attribute is present and enabled.
struct AttributeRule {
    attributes: &'static [&'static str],
    domain: SecurityDomain,
    controls: &'static [&'static str],
}

struct KeywordRule {
    keywords: &'static [&'static str],
    domain: SecurityDomain,
    controls: &'static [&'static str],
}

use SecurityDomain::*;
use TypeMatch::{Exact, Prefix};

const fn rule(
    matcher: TypeMatch,
    domains: &'static [SecurityDomain],
    controls: &'static [&'static str],
) -> TypeRule {
    TypeRule {
        matcher,
        domains,
        controls,
    }
}

const DATA_STORE: &[SecurityDomain] = &[AccessControl];
const DATA_STORE_CONTROLS: &[&str] = &["CC6.1"];

static TYPE_RULES: &[TypeRule] = &[
    // identity
    rule(Exact("aws_iam_user"), &[AccessControl], &["CC6.1", "CC6.2"]),
    rule(Exact("aws_iam_access_key"), &[AccessControl], &["CC6.1", "CC6.2"]),
    rule(Prefix("aws_iam_"), &[AccessControl], &["CC6.1", "CC6.3"]),
    rule(Prefix("azurerm_role_"), &[AccessControl], &["CC6.1", "CC6.3"]),
    rule(Prefix("google_project_iam_"), &[AccessControl], &["CC6.1", "CC6.3"]),
    rule(Exact("google_service_account"), &[AccessControl], &["CC6.1", "CC6.2"]),
    // storage policies
    rule(Exact("aws_s3_bucket_policy"), &[AccessControl], &["CC6.1", "CC6.3"]),
    rule(Exact("aws_s3_bucket_public_access_block"), &[AccessControl], &["CC6.1", "CC6.3"]),
    rule(Exact("aws_s3_bucket_server_side_encryption_configuration"), &[Encryption], &["CC6.8"]),
    rule(Exact("aws_s3_bucket_versioning"), &[Backup], &["A1.2"]),
    rule(Exact("aws_s3_bucket_logging"), &[Monitoring], &["CC7.2"]),
    rule(Exact("aws_ebs_encryption_by_default"), &[Encryption], &["CC6.8"]),
    // key management
    rule(Prefix("aws_kms_"), &[Encryption], &["CC6.8"]),
    rule(Prefix("azurerm_key_vault"), &[Encryption], &["CC6.8"]),
    rule(Prefix("google_kms_"), &[Encryption], &["CC6.8"]),
    rule(Prefix("aws_acm_"), &[Encryption], &["CC6.7", "CC6.8"]),
    rule(Prefix("aws_cloudfront_"), &[Encryption, Network], &["CC6.7", "CC6.8"]),
    // data stores: encryption and backups come from attributes
    rule(Exact("aws_s3_bucket"), DATA_STORE, DATA_STORE_CONTROLS),
    rule(Exact("aws_db_instance"), DATA_STORE, DATA_STORE_CONTROLS),
    rule(Exact("aws_rds_cluster"), DATA_STORE, DATA_STORE_CONTROLS),
    rule(Exact("aws_dynamodb_table"), DATA_STORE, DATA_STORE_CONTROLS),
    rule(Exact("aws_ebs_volume"), DATA_STORE, DATA_STORE_CONTROLS),
    rule(Exact("aws_efs_file_system"), DATA_STORE, DATA_STORE_CONTROLS),
    rule(Exact("aws_secretsmanager_secret"), DATA_STORE, DATA_STORE_CONTROLS),
    rule(Exact("azurerm_storage_account"), DATA_STORE, DATA_STORE_CONTROLS),
    rule(Exact("google_storage_bucket"), DATA_STORE, DATA_STORE_CONTROLS),
    rule(Exact("google_sql_database_instance"), DATA_STORE, DATA_STORE_CONTROLS),
    // network
    rule(Prefix("aws_vpc"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Prefix("aws_security_group"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Prefix("aws_network_acl"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Exact("aws_subnet"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Prefix("aws_route_table"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Exact("aws_internet_gateway"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Exact("aws_nat_gateway"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Prefix("aws_lb"), &[Network], &["CC6.6", "CC6.7"]),
    rule(Prefix("aws_alb"), &[Network], &["CC6.6", "CC6.7"]),
    rule(Prefix("aws_wafv2_"), &[Network], &["CC6.6", "CC6.8"]),
    rule(Prefix("azurerm_network_security_"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Exact("azurerm_virtual_network"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Exact("azurerm_subnet"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Exact("google_compute_firewall"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Exact("google_compute_network"), &[Network], &["CC6.6", "CC7.1"]),
    rule(Exact("google_compute_subnetwork"), &[Network], &["CC6.6", "CC7.1"]),
    // monitoring
    rule(Exact("aws_cloudtrail"), &[Monitoring], &["CC7.2", "CC7.4"]),
    rule(Exact("aws_flow_log"), &[Monitoring], &["CC7.2"]),
    rule(Prefix("aws_cloudwatch_"), &[Monitoring], &["CC7.2"]),
    rule(Prefix("aws_config_"), &[Monitoring], &["CC7.2", "CC8.1"]),
    rule(Prefix("aws_guardduty_"), &[Monitoring], &["CC7.3", "CC7.4"]),
    rule(Prefix("aws_securityhub_"), &[Monitoring], &["CC7.3", "CC7.4"]),
    rule(Prefix("azurerm_monitor_"), &[Monitoring], &["CC7.2"]),
    rule(Prefix("google_logging_"), &[Monitoring], &["CC7.2"]),
    // resilience
    rule(Prefix("aws_backup_"), &[Backup], &["A1.2"]),
    rule(Prefix("aws_autoscaling_"), &[Availability], &["A1.1"]),
];

static ATTRIBUTE_RULES: &[AttributeRule] = &[
    AttributeRule {
        attributes: &[
            "server_side_encryption_configuration",
            "server_side_encryption",
            "storage_encrypted",
            "encrypted",
            "kms_key_id",
            "kms_master_key_id",
            "encryption_configuration",
            "encryption",
        ],
        domain: Encryption,
        controls: &["CC6.8"],
    },
    AttributeRule {
        attributes: &["versioning", "backup_retention_period", "point_in_time_recovery"],
        domain: Backup,
        controls: &["A1.2"],
    },
    AttributeRule {
        attributes: &["logging", "enabled_cloudwatch_logs_exports", "access_logs"],
        domain: Monitoring,
        controls: &["CC7.2"],
    },
    AttributeRule {
        attributes: &["multi_az"],
        domain: Availability,
        controls: &["A1.1"],
    },
];

static KEYWORD_RULES: &[KeywordRule] = &[
    KeywordRule {
        keywords: &["iam", "auth", "access"],
        domain: AccessControl,
        controls: &["CC6.1", "CC6.3"],
    },
    KeywordRule {
        keywords: &["network", "firewall", "security_group"],
        domain: Network,
        controls: &["CC6.6", "CC7.1"],
    },
    KeywordRule {
        keywords: &["encrypt", "kms", "key"],
        domain: Encryption,
        controls: &["CC6.8"],
    },
    KeywordRule {
        keywords: &["log", "monitor", "audit"],
        domain: Monitoring,
        controls: &["CC7.2"],
    },
];

const HIGH_RISK_TYPES: &[&str] = &[
    "aws_iam_user",
    "aws_iam_role",
    "aws_iam_access_key",
    "aws_s3_bucket",
    "aws_security_group",
    "aws_db_instance",
    "aws_rds_cluster",
    "aws_kms_key",
];

pub fn annotate(resource_type: &str, attributes: &BTreeMap<String, AttrValue>) -> Annotation {
    let mut domains: BTreeSet<SecurityDomain> = BTreeSet::new();
    let mut controls: BTreeSet<&'static str> = BTreeSet::new();

    if let Some(rule) = TYPE_RULES.iter().find(|r| r.matcher.matches(resource_type)) {
        domains.extend(rule.domains.iter().copied());
        controls.extend(rule.controls.iter().copied());
    }

    for rule in ATTRIBUTE_RULES {
        let hit = rule
            .attributes
            .iter()
            .any(|a| attributes.get(*a).is_some_and(AttrValue::is_enabled));
        if hit {
            domains.insert(rule.domain);
            controls.extend(rule.controls.iter().copied());
        }
    }

    if domains.is_empty() {
        let lowered = resource_type.to_ascii_lowercase();
        for rule in KEYWORD_RULES {
            if rule.keywords.iter().any(|k| lowered.contains(k)) {
                domains.insert(rule.domain);
                controls.extend(rule.controls.iter().copied());
            }
        }
    }

    if domains.is_empty() {
        domains.insert(Uncategorized);
    }

    let risk_level = risk_level(resource_type, attributes, controls.is_empty());
    Annotation {
        security_domains: domains.into_iter().collect(),
        control_codes: controls.into_iter().map(str::to_string).collect(),
        risk_level,
        compliance_status: compliance_status(resource_type, attributes),
    }
}

/// +3 for an inherently sensitive type, +2 for a detected misconfiguration,
/// +1 when no control applies, +3 for public exposure.
fn risk_level(
    resource_type: &str,
    attributes: &BTreeMap<String, AttrValue>,
    no_controls: bool,
) -> RiskLevel {
    let mut score = 0;
    if HIGH_RISK_TYPES.contains(&resource_type) {
        score += 3;
    }
    if has_misconfiguration(resource_type, attributes) {
        score += 2;
    }
    if no_controls {
        score += 1;
    }
    if has_public_exposure(attributes) {
        score += 3;
    }
    RiskLevel::from_score(score)
}

fn has_misconfiguration(resource_type: &str, attributes: &BTreeMap<String, AttrValue>) -> bool {
    let t = resource_type.to_ascii_lowercase();

    if t == "aws_s3_bucket" && !has_enabled_key(attributes, &["encrypt", "kms"]) {
        return true;
    }

    if (t.contains("rds") || t.contains("db_instance"))
        && !attributes
            .get("storage_encrypted")
            .is_some_and(AttrValue::is_enabled)
    {
        return true;
    }

    if t.contains("security_group") && any_leaf(attributes, &mut |key, value| {
        key.contains("cidr") && value.render().contains("0.0.0.0/0")
    }) {
        return true;
    }

    false
}

fn has_public_exposure(attributes: &BTreeMap<String, AttrValue>) -> bool {
    any_leaf(attributes, &mut |key, value| {
        if key.contains("public") && value.as_bool() == Some(true) {
            return true;
        }
        if key.contains("cidr") && value.render().contains("0.0.0.0/0") {
            return true;
        }
        if key.contains("policy") && value.render().contains('*') {
            return true;
        }
        key == "acl" && value.as_text().is_some_and(|acl| acl.starts_with("public"))
    })
}

/// Encryption is expected of storage and key types, access control of
/// identity and firewall types, monitoring of audit trail types.
fn compliance_status(
    resource_type: &str,
    attributes: &BTreeMap<String, AttrValue>,
) -> ComplianceStatus {
    let t = resource_type.to_ascii_lowercase();
    let mut required = 0u32;
    let mut implemented = 0u32;

    if t.contains("s3") || t.contains("rds") || t.contains("db_instance") || t.contains("kms") {
        required += 1;
        if t.contains("kms")
            || t.contains("encryption")
            || has_enabled_key(attributes, &["encrypt", "kms"])
        {
            implemented += 1;
        }
    }
    if t.contains("iam") || t.contains("security_group") {
        required += 1;
        if has_enabled_key(attributes, &["policy", "role", "permission", "ingress", "egress"]) {
            implemented += 1;
        }
    }
    if t.contains("cloudtrail") || t.contains("cloudwatch") {
        required += 1;
        if has_enabled_key(attributes, &["log", "monitor", "enable"]) {
            implemented += 1;
        }
    }

    match (required, implemented) {
        (0, _) => ComplianceStatus::NotApplicable,
        (r, i) if i >= r => ComplianceStatus::Compliant,
        (_, i) if i > 0 => ComplianceStatus::PartiallyCompliant,
        _ => ComplianceStatus::NonCompliant,
    }
}

fn has_enabled_key(attributes: &BTreeMap<String, AttrValue>, needles: &[&str]) -> bool {
    any_leaf(attributes, &mut |key, value| {
        needles.iter().any(|n| key.contains(n)) && value.is_enabled()
    })
}

/// Visits every key/value pair, descending into nested blocks and lists.
fn any_leaf(
    attributes: &BTreeMap<String, AttrValue>,
    visit: &mut dyn FnMut(&str, &AttrValue) -> bool,
) -> bool {
    attributes
        .iter()
        .any(|(key, value)| visit_value(&key.to_ascii_lowercase(), value, visit))
}

fn visit_value(
    key: &str,
    value: &AttrValue,
    visit: &mut dyn FnMut(&str, &AttrValue) -> bool,
) -> bool {
    if visit(key, value) {
        return true;
    }
    match value {
        AttrValue::Map(map) => any_leaf(map, visit),
        AttrValue::List(items) => items.iter().any(|item| match item {
            AttrValue::Map(map) => any_leaf(map, visit),
            _ => false,
        }),
        _ => false,
    }
}

/// Deployment environment named by a path segment, or `unknown`.
pub fn environment_for_path(path: &str) -> &'static str {
    for segment in path.split(['/', '\\']).rev() {
        let stem = segment.split('.').next().unwrap_or(segment).to_ascii_lowercase();
        let env = match stem.as_str() {
            "prod" | "production" | "prd" => "prod",
            "staging" | "stage" | "stg" => "staging",
            "dev" | "development" => "dev",
            "test" | "testing" | "qa" => "test",
            _ => continue,
        };
        return env;
    }
    "unknown"
}
