//! In-memory comparison backend for tests
//!
//! Verdicts are scripted per checkpoint name (optionally per target).
//! Jobs resolve immediately, after a delay, or only when released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::jobs::JobBoard;
use super::{JobId, JobOutcome, JobStatus, RunConfig, RunHandle, VisualBackend};
use crate::checkpoint::{MatchStrategy, Snapshot};
use crate::error::{HarnessError, HarnessResult};
use crate::result::Verdict;
use crate::target::TargetDescriptor;

/// One checkpoint the backend received
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: JobId,
    pub test_name: String,
    pub checkpoint_name: String,
    pub target: TargetDescriptor,
    pub strategy: MatchStrategy,
    pub digest: String,
}

struct Run {
    config: RunConfig,
    closed: bool,
}

#[derive(Default)]
struct State {
    runs: HashMap<String, Run>,
    submissions: Vec<Submission>,
    held: Vec<(JobId, JobStatus)>,
    open_runs: usize,
    peak_open_runs: usize,
    next_id: u64,
}

#[derive(Default)]
pub struct ScriptedBackend {
    state: Mutex<State>,
    jobs: Arc<JobBoard>,
    verdicts: HashMap<String, Verdict>,
    target_verdicts: HashMap<(String, String), Verdict>,
    hold: bool,
    delay: Option<Duration>,
    cap: Option<usize>,
    fail_submit: bool,
    fail_poll: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verdict for every job of this checkpoint (default: passed)
    pub fn with_verdict(mut self, checkpoint: &str, verdict: Verdict) -> Self {
        self.verdicts.insert(checkpoint.to_string(), verdict);
        self
    }

    /// Verdict for this checkpoint on the target with the given identifier
    pub fn with_target_verdict(mut self, checkpoint: &str, target: &str, verdict: Verdict) -> Self {
        self.target_verdicts
            .insert((checkpoint.to_string(), target.to_string()), verdict);
        self
    }

    /// Keep jobs unresolved until `release_all`
    pub fn holding(mut self) -> Self {
        self.hold = true;
        self
    }

    /// Resolve each job this long after submission
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report an account limit on parallel runs
    pub fn with_concurrency_cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    pub fn failing_submit(mut self) -> Self {
        self.fail_submit = true;
        self
    }

    pub fn failing_poll(mut self) -> Self {
        self.fail_poll = true;
        self
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Most runs that were open at the same time
    pub fn peak_open_runs(&self) -> usize {
        self.state.lock().peak_open_runs
    }

    /// Runs opened and not yet closed
    pub fn open_runs(&self) -> usize {
        self.state.lock().open_runs
    }

    /// Resolve every held job with its scripted verdict
    pub fn release_all(&self) {
        let held = std::mem::take(&mut self.state.lock().held);
        for (job, status) in held {
            self.jobs.resolve(&job, status);
        }
    }

    /// Jobs not yet resolved
    pub fn pending_jobs(&self) -> usize {
        self.jobs.unresolved().len()
    }

    fn scripted_status(&self, checkpoint: &str, target: &TargetDescriptor) -> JobStatus {
        let verdict = self
            .target_verdicts
            .get(&(checkpoint.to_string(), target.identifier().to_string()))
            .or_else(|| self.verdicts.get(checkpoint))
            .copied()
            .unwrap_or(Verdict::Passed);

        let diff = (verdict == Verdict::Failed)
            .then(|| format!("'{}' differs from baseline on {}", checkpoint, target));
        JobStatus { verdict, diff }
    }
}

#[async_trait]
impl VisualBackend for ScriptedBackend {
    async fn open_run(&self, config: &RunConfig) -> HarnessResult<RunHandle> {
        if config.api_key.is_empty() {
            return Err(HarnessError::Backend("missing api key".to_string()));
        }

        let mut state = self.state.lock();
        state.next_id += 1;
        let handle = RunHandle(format!("run-{}", state.next_id));
        state.runs.insert(
            handle.0.clone(),
            Run {
                config: config.clone(),
                closed: false,
            },
        );
        state.open_runs += 1;
        state.peak_open_runs = state.peak_open_runs.max(state.open_runs);
        Ok(handle)
    }

    async fn submit_checkpoint(
        &self,
        run: &RunHandle,
        name: &str,
        snapshot: &Snapshot,
        strategy: MatchStrategy,
    ) -> HarnessResult<JobId> {
        if self.fail_submit {
            return Err(HarnessError::Backend("service unavailable".to_string()));
        }

        let (job, batch_id, status) = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let job = JobId(format!("job-{}", state.next_id));

            let r = state
                .runs
                .get(&run.0)
                .ok_or_else(|| HarnessError::Backend(format!("unknown run {}", run.0)))?;
            if r.closed {
                return Err(HarnessError::Backend(format!("run {} is closed", run.0)));
            }
            let config = r.config.clone();

            state.submissions.push(Submission {
                job: job.clone(),
                test_name: config.test_name.clone(),
                checkpoint_name: name.to_string(),
                target: config.target.clone(),
                strategy,
                digest: snapshot.digest().to_string(),
            });
            (job, config.batch_id, self.scripted_status(name, &config.target))
        };

        self.jobs.register(&batch_id, job.clone());

        if self.hold {
            self.state.lock().held.push((job.clone(), status));
        } else if let Some(delay) = self.delay {
            let jobs = self.jobs.clone();
            let id = job.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                jobs.resolve(&id, status);
            });
        } else {
            self.jobs.resolve(&job, status);
        }

        Ok(job)
    }

    async fn close_run(&self, run: &RunHandle) -> HarnessResult<()> {
        let mut state = self.state.lock();
        let r = state
            .runs
            .get_mut(&run.0)
            .ok_or_else(|| HarnessError::Backend(format!("unknown run {}", run.0)))?;
        if !r.closed {
            r.closed = true;
            state.open_runs -= 1;
        }
        Ok(())
    }

    async fn poll_job(&self, job: &JobId) -> HarnessResult<JobStatus> {
        if self.fail_poll {
            return Err(HarnessError::Backend("poll failed: 503".to_string()));
        }
        self.jobs
            .status(job)
            .ok_or_else(|| HarnessError::Backend(format!("unknown job {}", job)))
    }

    async fn await_batch(&self, batch_id: &str, timeout: Option<Duration>) -> HarnessResult<Vec<JobOutcome>> {
        Ok(self.jobs.wait_for_batch(batch_id, timeout).await)
    }

    fn concurrency_cap(&self) -> Option<usize> {
        self.cap
    }
}
