//! Run summaries and command reports.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::pool::PoolProgress;
use crate::state::{RunInfo, Stage, TableStatus};

/// Final outcome of one table in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableOutcome {
    Success,
    Failed,
    /// Stopped before reaching a terminal state (cancelled run).
    Incomplete,
}

/// Per-table line of a [`MigrationResult`].
#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    pub target: String,
    pub status: TableStatus,
    pub outcome: TableOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Rows written by this run.
    pub rows_transferred: u64,
    /// Stages already complete from an earlier run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_stages: Vec<Stage>,
}

/// Result of a `run` or `resume`.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub run_id: String,
    /// `completed`, `failed` or `cancelled`.
    pub status: String,
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub tables_total: usize,
    pub tables_success: usize,
    pub tables_failed: usize,
    pub rows_transferred: u64,
    pub rows_per_second: u64,
    pub views_created: usize,
    pub views_skipped: usize,
    pub tables: Vec<TableReport>,
}

impl MigrationResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| t.outcome == TableOutcome::Failed)
            .map(|t| t.table.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.status == "completed"
    }

    /// Human-readable summary, one line per table.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Run {} {} in {:.1}s: {}/{} tables, {} rows ({} rows/sec)",
            self.run_id,
            self.status,
            self.duration_seconds,
            self.tables_success,
            self.tables_total,
            self.rows_transferred,
            self.rows_per_second
        );
        for t in &self.tables {
            let _ = write!(out, "  {:<32} {:<20} {:>12} rows", t.table, t.status.to_string(), t.rows_transferred);
            if !t.skipped_stages.is_empty() {
                let skipped: Vec<&str> = t.skipped_stages.iter().map(|s| s.as_str()).collect();
                let _ = write!(out, "  (skipped: {})", skipped.join(", "));
            }
            if let Some(error) = &t.error {
                let _ = write!(out, "  error: {}", error);
            }
            out.push('\n');
        }
        if self.views_created + self.views_skipped > 0 {
            let _ = writeln!(
                out,
                "  views: {} created, {} skipped",
                self.views_created, self.views_skipped
            );
        }
        out
    }
}

/// One table of a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunTable {
    pub table: String,
    pub target: String,
    pub chunk_key: String,
    pub estimated_rows: i64,
    pub chunks: usize,
    pub ddl: Vec<String>,
    pub deferred: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a run would do, without touching the target.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub plan_hash: String,
    pub tables: Vec<DryRunTable>,
    pub views: Vec<String>,
}

impl DryRunReport {
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Plan {} ({} tables)", &self.plan_hash[..self.plan_hash.len().min(12)], self.tables.len());
        for t in &self.tables {
            match &t.error {
                Some(error) => {
                    let _ = writeln!(out, "  {:<32} ERROR {}", t.table, error);
                }
                None => {
                    let _ = writeln!(
                        out,
                        "  {:<32} -> {:<40} ~{} rows in {} chunks ({})",
                        t.table, t.target, t.estimated_rows, t.chunks, t.chunk_key
                    );
                }
            }
        }
        for view in &self.views {
            let _ = writeln!(out, "  view {}", view);
        }
        out
    }
}

/// Row count comparison for one table.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRow {
    pub table: String,
    pub source_rows: i64,
    /// None when the target table is missing.
    pub target_rows: Option<i64>,
    pub matches: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub tables: Vec<ValidationRow>,
}

impl ValidationReport {
    pub fn all_match(&self) -> bool {
        self.tables.iter().all(|t| t.matches)
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        for t in &self.tables {
            let target = t
                .target_rows
                .map(|n| n.to_string())
                .unwrap_or_else(|| "missing".to_string());
            let _ = writeln!(
                out,
                "  {:<32} source {:>12}  target {:>12}  {}",
                t.table,
                t.source_rows,
                target,
                if t.matches { "OK" } else { "MISMATCH" }
            );
        }
        out
    }
}

/// Connectivity of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub db_type: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub source: EndpointHealth,
    pub target: EndpointHealth,
    pub healthy: bool,
}

/// Persisted progress of one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableProgress {
    pub table: String,
    pub status: TableStatus,
    pub progress: PoolProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State log and pool progress as stored.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub run: Option<RunInfo>,
    pub tables: Vec<TableProgress>,
}

impl StatusReport {
    pub fn summary(&self) -> String {
        let mut out = String::new();
        match &self.run {
            Some(run) => {
                let _ = writeln!(
                    out,
                    "Last run {} ({}), started {}",
                    run.run_id,
                    run.status.as_str(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            None => out.push_str("No migration runs recorded\n"),
        }
        for t in &self.tables {
            let p = &t.progress;
            let _ = write!(
                out,
                "  {:<32} {:<20} chunks {}/{} done, {} failed",
                t.table,
                t.status.to_string(),
                p.done,
                p.total,
                p.failed
            );
            if let Some(error) = &t.error {
                let _ = write!(out, "  error: {}", error);
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(table: &str, outcome: TableOutcome, status: TableStatus) -> TableReport {
        TableReport {
            table: table.into(),
            target: format!("public.{}", table),
            status,
            outcome,
            error: (outcome == TableOutcome::Failed).then(|| "boom".to_string()),
            rows_transferred: 10,
            skipped_stages: vec![],
        }
    }

    #[test]
    fn test_result_json_and_failed_tables() {
        let now = Utc::now();
        let result = MigrationResult {
            run_id: "r1".into(),
            status: "failed".into(),
            resumed: false,
            started_at: now,
            completed_at: now,
            duration_seconds: 1.0,
            tables_total: 2,
            tables_success: 1,
            tables_failed: 1,
            rows_transferred: 20,
            rows_per_second: 20,
            views_created: 0,
            views_skipped: 0,
            tables: vec![
                report("a", TableOutcome::Success, TableStatus::ConstraintsDone),
                report("b", TableOutcome::Failed, TableStatus::Failed(Stage::SchemaCreated)),
            ],
        };
        assert_eq!(result.failed_tables(), vec!["b"]);
        assert!(!result.is_success());

        let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
        assert_eq!(json["tables"][1]["outcome"], "failed");
        assert_eq!(json["tables"][1]["error"], "boom");
        assert!(json["tables"][0].get("error").is_none());
        assert!(result.summary().contains("error: boom"));
    }

    #[test]
    fn test_validation_summary() {
        let report = ValidationReport {
            tables: vec![
                ValidationRow {
                    table: "a".into(),
                    source_rows: 5,
                    target_rows: Some(5),
                    matches: true,
                },
                ValidationRow {
                    table: "b".into(),
                    source_rows: 5,
                    target_rows: None,
                    matches: false,
                },
            ],
        };
        assert!(!report.all_match());
        let text = report.summary();
        assert!(text.contains("missing"));
        assert!(text.contains("MISMATCH"));
    }
}
