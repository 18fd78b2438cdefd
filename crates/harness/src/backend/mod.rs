//! Visual comparison backends
//!
//! A backend receives checkpoint snapshots grouped into runs (one run per
//! execution and target) and resolves each submitted checkpoint into a
//! verdict asynchronously. The aggregator only ever talks to this trait.

pub mod baseline;
mod jobs;
pub mod scripted;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::checkpoint::{MatchStrategy, Snapshot};
use crate::error::HarnessResult;
use crate::result::Verdict;
use crate::target::{TargetDescriptor, Viewport};

pub use baseline::{BaselineBackend, BaselineConfig};
pub use scripted::ScriptedBackend;

/// Everything a backend needs to open a run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub api_key: String,
    pub app_name: String,
    pub test_name: String,
    /// Viewport of the local run that produced the snapshots
    pub viewport: Viewport,
    pub batch_id: String,
    pub target: TargetDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current state of one comparison job
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub verdict: Verdict,
    pub diff: Option<String>,
}

impl JobStatus {
    pub fn unresolved() -> Self {
        Self {
            verdict: Verdict::Unresolved,
            diff: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.verdict != Verdict::Unresolved
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job: JobId,
    pub status: JobStatus,
}

#[async_trait]
pub trait VisualBackend: Send + Sync {
    async fn open_run(&self, config: &RunConfig) -> HarnessResult<RunHandle>;

    async fn submit_checkpoint(
        &self,
        run: &RunHandle,
        name: &str,
        snapshot: &Snapshot,
        strategy: MatchStrategy,
    ) -> HarnessResult<JobId>;

    async fn close_run(&self, run: &RunHandle) -> HarnessResult<()>;

    /// Non-blocking status check
    async fn poll_job(&self, job: &JobId) -> HarnessResult<JobStatus>;

    /// Block until every job of the batch resolves (or `timeout` passes) and
    /// return the status of all of them
    async fn await_batch(&self, batch_id: &str, timeout: Option<Duration>) -> HarnessResult<Vec<JobOutcome>>;

    /// Parallel runs the account allows, if the backend limits them
    fn concurrency_cap(&self) -> Option<usize> {
        None
    }
}
