use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::operation::OperationKey;
use crate::record::{ExecutionRecord, RecordSnapshot};
use crate::status::{AggregateStatus, OperationStatus};

/// Outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub aggregate: AggregateStatus,
    /// Number of operations per terminal status
    pub counts: BTreeMap<OperationStatus, usize>,
    /// One snapshot per operation, in declaration order
    pub operations: Vec<RecordSnapshot>,
    /// Infrastructure degradations (cache, cobuild, persistence) and hook warnings
    pub warnings: Vec<String>,
    pub duration: Duration,
    /// The run stopped dispatching early (abort signal or stop-on-first-failure)
    pub aborted: bool,
}

impl RunSummary {
    pub fn from_records(
        records: &[ExecutionRecord],
        warnings: Vec<String>,
        duration: Duration,
        aborted: bool,
    ) -> Self {
        let mut counts = BTreeMap::new();
        for record in records {
            *counts.entry(record.status()).or_insert(0) += 1;
        }

        Self {
            aggregate: AggregateStatus::from_statuses(records.iter().map(|r| r.status())),
            counts,
            operations: records.iter().map(ExecutionRecord::snapshot).collect(),
            warnings,
            duration,
            aborted,
        }
    }

    pub fn is_success(&self) -> bool {
        self.aggregate.is_success()
    }

    pub fn count(&self, status: OperationStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn status_of(&self, key: &OperationKey) -> Option<OperationStatus> {
        self.operation(key).map(|op| op.status)
    }

    pub fn operation(&self, key: &OperationKey) -> Option<&RecordSnapshot> {
        self.operations.iter().find(|op| &op.key == key)
    }

    /// Plain-text report: one row per operation, then the totals
    pub fn print_table(&self) -> String {
        let width = self
            .operations
            .iter()
            .map(|op| op.key.to_string().len())
            .max()
            .unwrap_or(0)
            .max("Operation".len());

        let mut out = String::new();
        let _ = writeln!(out, "{:<width$}  {:<22}  {:>10}", "Operation", "Status", "Duration");
        let _ = writeln!(out, "{}", "-".repeat(width + 36));
        for op in &self.operations {
            let _ = writeln!(
                out,
                "{:<width$}  {:<22}  {:>9.2}s",
                op.key.to_string(),
                op.status.as_str(),
                op.duration_ms as f64 / 1000.0,
            );
        }
        let _ = writeln!(out, "{}", "-".repeat(width + 36));

        let totals: Vec<String> = self
            .counts
            .iter()
            .map(|(status, n)| format!("{} {}", n, status))
            .collect();
        let _ = writeln!(
            out,
            "Run {}{} in {:.2}s: {}",
            self.aggregate,
            if self.aborted { " (aborted)" } else { "" },
            self.duration.as_secs_f64(),
            totals.join(", ")
        );

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "Warnings:");
            for warning in &self.warnings {
                let _ = writeln!(out, "  - {}", warning);
            }
        }
        out
    }
}
