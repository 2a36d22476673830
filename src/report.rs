use clap::ValueEnum;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::IndexError;
use crate::mapper::{ComplianceStatus, RiskLevel};
use crate::query::QueryResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Json,
    Csv,
    /// Control coverage table followed by risk, compliance and environment counts.
    Summary,
    /// Environment by risk level.
    Matrix,
}

const CSV_HEADER: &str = concat!(
    "id,type,name,file,line_start,line_end,environment,",
    "risk_level,compliance_status,control_codes,security_domains"
);

pub fn render(result: &QueryResult, format: ReportFormat) -> Result<String, IndexError> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_string_pretty(result)?),
        ReportFormat::Csv => Ok(render_csv(result)),
        ReportFormat::Summary => Ok(render_summary(result)),
        ReportFormat::Matrix => Ok(render_matrix(result)),
    }
}

fn render_csv(result: &QueryResult) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + result.len() * 128);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for r in &result.resources {
        let domains: Vec<&str> = r.security_domains.iter().map(|d| d.as_str()).collect();
        let row = [
            escape_csv(&r.id),
            escape_csv(&r.resource_type),
            escape_csv(&r.name),
            escape_csv(&r.file_path),
            r.line_start.to_string(),
            r.line_end.to_string(),
            escape_csv(&r.environment),
            r.risk_level.to_string(),
            r.compliance_status.to_string(),
            escape_csv(&r.control_codes.join(";")),
            escape_csv(&domains.join(";")),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn escape_csv(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

struct Coverage {
    resources: usize,
    compliant: usize,
}

fn coverage(result: &QueryResult) -> BTreeMap<&str, Coverage> {
    let mut out: BTreeMap<&str, Coverage> = BTreeMap::new();
    for r in &result.resources {
        for code in &r.control_codes {
            let entry = out.entry(code.as_str()).or_insert(Coverage {
                resources: 0,
                compliant: 0,
            });
            entry.resources += 1;
            if r.compliance_status == ComplianceStatus::Compliant {
                entry.compliant += 1;
            }
        }
    }
    out
}

fn render_summary(result: &QueryResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Query: {}", result.query);
    let _ = writeln!(out, "Generation: {}", result.generation_id);
    let _ = writeln!(out, "Resources: {}", result.len());
    out.push('\n');

    if result.is_empty() {
        out.push_str("No resources found.\n");
        return out;
    }

    let rows = coverage(result);
    let width = rows.keys().map(|c| c.len()).max().unwrap_or(0).max("Control".len());
    let _ = writeln!(
        out,
        "{:<width$}  {:>9}  {:>9}  {:>8}",
        "Control", "Resources", "Compliant", "Rate"
    );
    for (control, c) in &rows {
        let rate = c.compliant as f64 / c.resources as f64 * 100.0;
        let _ = writeln!(
            out,
            "{control:<width$}  {:>9}  {:>9}  {:>7.1}%",
            c.resources, c.compliant, rate
        );
    }
    let covered = result.resources.iter().filter(|r| !r.control_codes.is_empty()).count();
    let _ = writeln!(
        out,
        "\nControl coverage: {:.1}% ({covered}/{})",
        covered as f64 / result.len() as f64 * 100.0,
        result.len()
    );

    let risk = result.count_by_risk();
    out.push_str("\nRisk Distribution:\n");
    for level in [RiskLevel::High, RiskLevel::Medium, RiskLevel::Low] {
        if let Some(n) = risk.get(level.as_str()) {
            let _ = writeln!(out, "  {level}: {n}");
        }
    }

    out.push_str("\nCompliance Status:\n");
    for (status, n) in result.count_by_compliance_status() {
        let _ = writeln!(out, "  {status}: {n}");
    }

    out.push_str("\nEnvironments:\n");
    for (env, n) in result.count_by_environment() {
        let _ = writeln!(out, "  {env}: {n}");
    }
    out
}

fn render_matrix(result: &QueryResult) -> String {
    let mut rows: BTreeMap<&str, [usize; 3]> = BTreeMap::new();
    for r in &result.resources {
        let row = rows.entry(r.environment.as_str()).or_default();
        match r.risk_level {
            RiskLevel::High => row[0] += 1,
            RiskLevel::Medium => row[1] += 1,
            RiskLevel::Low => row[2] += 1,
        }
    }

    let mut out = String::from("| Environment | High | Medium | Low | Total |\n");
    out.push_str("|-------------|------|--------|-----|-------|\n");
    for (env, [high, medium, low]) in rows {
        let _ = writeln!(out, "| {env} | {high} | {medium} | {low} | {} |", high + medium + low);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::AttrValue;
    use crate::mapper::ComplianceStatus::{Compliant, NonCompliant};
    use crate::mapper::RiskLevel::{High, Medium};
    use crate::mapper::SecurityDomain;
    use crate::snapshot::ResourceRecord;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn record(
        name: &str,
        env: &str,
        risk: RiskLevel,
        status: ComplianceStatus,
        controls: &[&str],
    ) -> Arc<ResourceRecord> {
        Arc::new(ResourceRecord {
            id: format!("id-{name}"),
            resource_type: "aws_s3_bucket".into(),
            name: name.into(),
            file_path: format!("/infra/{env}/main.tf"),
            line_start: 1,
            line_end: 4,
            attributes: BTreeMap::from([("bucket".to_string(), AttrValue::text(name))]),
            security_domains: vec![SecurityDomain::Encryption, SecurityDomain::AccessControl],
            control_codes: controls.iter().map(|c| c.to_string()).collect(),
            risk_level: risk,
            compliance_status: status,
            environment: env.into(),
        })
    }

    fn result() -> QueryResult {
        QueryResult {
            query: "type=aws_s3_bucket".into(),
            generation_id: 3,
            resources: vec![
                record("logs", "prod", Medium, Compliant, &["CC6.1", "CC6.8"]),
                record("raw,data", "prod", High, NonCompliant, &["CC6.1"]),
                record("scratch", "dev", High, NonCompliant, &[]),
            ],
        }
    }

    #[test]
    fn csv_escapes_commas_and_joins_lists() {
        let csv = render(&result(), ReportFormat::Csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 4);
        assert!(lines[1].ends_with("prod,medium,compliant,CC6.1;CC6.8,encryption;access_control"));
        assert!(lines[2].contains("\"raw,data\""));
        assert_eq!(escape_csv("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn summary_lists_control_coverage_and_risk() {
        let text = render(&result(), ReportFormat::Summary).unwrap();
        assert!(text.contains("Resources: 3"));
        assert!(text.contains("CC6.1"));
        assert!(text.contains("50.0%"));
        assert!(text.contains("Control coverage: 66.7% (2/3)"));
        assert!(text.contains("high: 2"));
        assert!(text.find("high: 2") < text.find("medium: 1"));
    }

    #[test]
    fn empty_result_renders_without_error() {
        let empty = QueryResult {
            query: "control=CC9.9".into(),
            generation_id: 1,
            resources: Vec::new(),
        };
        assert!(render(&empty, ReportFormat::Summary).unwrap().contains("No resources found."));
        assert_eq!(render(&empty, ReportFormat::Csv).unwrap(), format!("{CSV_HEADER}\n"));
        let rendered = render(&empty, ReportFormat::Json).unwrap();
        let json: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(json["resources"].as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn matrix_groups_by_environment() {
        let text = render(&result(), ReportFormat::Matrix).unwrap();
        assert!(text.contains("| dev | 1 | 0 | 0 | 1 |"));
        assert!(text.contains("| prod | 1 | 1 | 0 | 2 |"));
    }
}
