//! Verdicts, per-checkpoint results and the suite report

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::batch::{Batch, ExecutionId};
use crate::error::HarnessResult;
use crate::target::RenderTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    Unresolved,
}

/// Final or interim verdict for one (checkpoint, target) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub execution: ExecutionId,
    pub test_name: String,
    pub checkpoint_name: String,
    pub target: RenderTarget,
    pub verdict: Verdict,
    pub diff_summary: Option<String>,
}

impl TestResult {
    pub fn is_failed(&self) -> bool {
        self.verdict == Verdict::Failed
    }

    pub fn to_failure(&self) -> FailedCheckpoint {
        FailedCheckpoint {
            execution: self.execution,
            test_name: self.test_name.clone(),
            checkpoint_name: self.checkpoint_name.clone(),
            target: self.target.clone(),
            diff_summary: self.diff_summary.clone(),
        }
    }
}

/// A checkpoint that differed from its baseline on one target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedCheckpoint {
    pub execution: ExecutionId,
    pub test_name: String,
    pub checkpoint_name: String,
    pub target: RenderTarget,
    pub diff_summary: Option<String>,
}

/// How one execution went, independent of its visual verdicts
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub execution: Option<ExecutionId>,
    pub test_name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub teardown_errors: Vec<String>,
}

/// Result of running a whole suite
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub batch: Batch,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub unresolved: usize,
    pub duration_ms: u64,
    pub executions: Vec<ExecutionSummary>,
    pub results: Vec<TestResult>,
}

impl SuiteReport {
    pub fn new(batch: Batch, executions: Vec<ExecutionSummary>, results: Vec<TestResult>, duration_ms: u64) -> Self {
        let count = |v: Verdict| results.iter().filter(|r| r.verdict == v).count();
        Self {
            total: results.len(),
            passed: count(Verdict::Passed),
            failed: count(Verdict::Failed),
            unresolved: count(Verdict::Unresolved),
            batch,
            duration_ms,
            executions,
            results,
        }
    }

    /// No failed executions, no visual differences, nothing left unresolved
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.unresolved == 0 && self.executions.iter().all(|e| e.success)
    }

    /// One line per result, then a summary line
    pub fn log_summary(&self) {
        for exec in &self.executions {
            if let Some(err) = &exec.error {
                error!("✗ {} - {}", exec.test_name, err);
            }
            for t in &exec.teardown_errors {
                warn!("  teardown of {}: {}", exec.test_name, t);
            }
        }

        for r in &self.results {
            match r.verdict {
                Verdict::Passed => info!("✓ {} / {} [{}]", r.test_name, r.checkpoint_name, r.target),
                Verdict::Failed => error!(
                    "✗ {} / {} [{}] - {}",
                    r.test_name,
                    r.checkpoint_name,
                    r.target,
                    r.diff_summary.as_deref().unwrap_or("differs from baseline")
                ),
                Verdict::Unresolved => warn!("? {} / {} [{}] unresolved", r.test_name, r.checkpoint_name, r.target),
            }
        }

        info!("");
        info!(
            "Batch '{}': {} passed, {} failed, {} unresolved ({} ms)",
            self.batch.display_name, self.passed, self.failed, self.unresolved, self.duration_ms
        );
    }

    /// Write the report as `test-results.json` under `dir`
    pub fn write_json(&self, dir: &Path) -> HarnessResult<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join("test-results.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, verdict: Verdict) -> TestResult {
        TestResult {
            execution: ExecutionId(1),
            test_name: "login".to_string(),
            checkpoint_name: name.to_string(),
            target: RenderTarget::Local,
            verdict,
            diff_summary: None,
        }
    }

    #[test]
    fn test_report_counts() {
        let report = SuiteReport::new(
            Batch::new("suite"),
            vec![],
            vec![
                result("a", Verdict::Passed),
                result("b", Verdict::Failed),
                result("c", Verdict::Unresolved),
                result("d", Verdict::Passed),
            ],
            10,
        );
        assert_eq!(report.total, 4);
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.unresolved, 1);
        assert!(!report.is_success());
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let report = SuiteReport::new(Batch::new("suite"), vec![], vec![result("a", Verdict::Passed)], 1);
        let path = report.write_json(dir.path()).unwrap();

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["passed"], 1);
        assert_eq!(json["results"][0]["target"], "local");
        assert_eq!(json["results"][0]["verdict"], "passed");
    }
}
