//! Run outcomes and metrics.

use crate::retry::RetryStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

/// What a caller sees after `ExecutionEngine::run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Pipeline name
    pub pipeline: String,

    pub status: RunStatus,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Wall-clock duration in seconds
    pub duration_secs: f64,

    /// Rows handed to the first executed step
    pub rows_in: usize,

    /// Rows produced by the last completed step
    pub rows_processed: usize,

    /// Steps completed during this run, in order
    pub steps_completed: Vec<String>,

    /// Step whose checkpoint the run resumed after
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,

    /// Checkpoint ids written during this run
    pub checkpoints: Vec<String>,

    /// Units whose slot ended as a failure marker
    pub failed_units: usize,

    /// Error description when the run failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Point-in-time view of execution metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Unit sizes in execution order
    pub batch_sizes: Vec<usize>,

    /// Mean unit duration in seconds, if any unit ran
    pub mean_unit_duration_secs: Option<f64>,

    pub units_total: usize,

    pub units_failed: usize,

    pub rows_processed: usize,

    pub checkpoints_written: usize,

    pub retry: RetryStats,
}

/// Totals across every run of one engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_runs: usize,
    pub successful: usize,
    pub failed: usize,
    /// Successful runs over total runs (0.0 - 1.0)
    pub success_rate: f64,
    /// Rows processed by successful runs
    pub total_rows_processed: usize,
}

impl ExecutionStats {
    /// Fold a finished run into the totals.
    pub fn record(&mut self, report: &RunReport) {
        self.total_runs += 1;
        match report.status {
            RunStatus::Success => {
                self.successful += 1;
                self.total_rows_processed += report.rows_processed;
            }
            RunStatus::Failed => self.failed += 1,
        }
        self.finalize();
    }

    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        if self.total_runs > 0 {
            self.success_rate = self.successful as f64 / self.total_runs as f64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: RunStatus, rows: usize) -> RunReport {
        let now = Utc::now();
        RunReport {
            pipeline: "p".to_string(),
            status,
            started_at: now,
            finished_at: now,
            duration_secs: 0.5,
            rows_in: rows,
            rows_processed: rows,
            steps_completed: Vec::new(),
            resumed_from: None,
            checkpoints: Vec::new(),
            failed_units: 0,
            error: None,
        }
    }

    #[test]
    fn test_execution_stats() {
        let mut stats = ExecutionStats::default();
        stats.record(&report(RunStatus::Success, 10));
        stats.record(&report(RunStatus::Failed, 99));
        stats.record(&report(RunStatus::Success, 5));

        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total_rows_processed, 15);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_report_serializes_status_lowercase() {
        let json = serde_json::to_value(report(RunStatus::Failed, 0)).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json.get("error").is_none());
    }
}
