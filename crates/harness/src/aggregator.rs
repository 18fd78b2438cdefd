//! Result aggregation
//!
//! The aggregator is the one piece of state shared by every execution in a
//! suite. Executions register, submit checkpoints while their session is
//! open, and close; closing fans the execution's checkpoints out to the
//! comparison backend (one job per checkpoint and target) under a semaphore
//! sized to the effective concurrency. Verdicts are collected by polling or
//! by the blocking end-of-suite wait.
//!
//! ```text
//! Created -> Open -> Collecting -> Dispatching -> Resolving -> Closed
//! ```
//!
//! The reported phase is the furthest stage any execution has reached;
//! `Closed` is terminal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::backend::{JobId, JobOutcome, JobStatus, RunConfig, VisualBackend};
use crate::batch::{Batch, BatchState, ExecutionId, ExecutionInfo};
use crate::checkpoint::Checkpoint;
use crate::config::SuiteConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::result::{TestResult, Verdict};
use crate::target::{RenderTarget, TargetDescriptor, TargetSet};

/// Pause between polls when the backend returns without progress
const POLL_INTERVAL: Duration = Duration::from_millis(200);

struct Execution {
    info: ExecutionInfo,
    open: bool,
    checkpoints: Vec<Checkpoint>,
}

/// One (checkpoint, target) verification
struct JobRecord {
    execution: ExecutionId,
    sequence: usize,
    checkpoint_name: String,
    target: RenderTarget,
    job: Option<JobId>,
    status: JobStatus,
}

struct State {
    phase: BatchState,
    next_execution: u64,
    executions: BTreeMap<ExecutionId, Execution>,
    jobs: Vec<JobRecord>,
}

impl State {
    fn advance(&mut self, to: BatchState) {
        if self.phase != BatchState::Closed && to > self.phase {
            self.phase = to;
        }
    }

    fn results(&self) -> Vec<TestResult> {
        let mut records: Vec<&JobRecord> = self.jobs.iter().collect();
        records.sort_by_key(|r| (r.execution, r.sequence));

        records
            .into_iter()
            .map(|r| TestResult {
                execution: r.execution,
                test_name: self
                    .executions
                    .get(&r.execution)
                    .map(|e| e.info.test_name.clone())
                    .unwrap_or_default(),
                checkpoint_name: r.checkpoint_name.clone(),
                target: r.target.clone(),
                verdict: r.status.verdict,
                diff_summary: r.status.diff.clone(),
            })
            .collect()
    }

    /// Dispatched jobs still waiting for a verdict
    fn pending(&self) -> Vec<(usize, JobId)> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.status.is_resolved())
            .filter_map(|(i, r)| r.job.clone().map(|j| (i, j)))
            .collect()
    }

    /// Returns how many records changed to a resolved status
    fn apply(&mut self, outcomes: &[JobOutcome]) -> usize {
        let mut progressed = 0;
        for outcome in outcomes.iter().filter(|o| o.status.is_resolved()) {
            for record in self.jobs.iter_mut() {
                if record.job.as_ref() == Some(&outcome.job) && !record.status.is_resolved() {
                    record.status = outcome.status.clone();
                    progressed += 1;
                }
            }
        }
        progressed
    }
}

struct Inner {
    batch: Batch,
    backend: Arc<dyn VisualBackend>,
    api_key: String,
    concurrency: usize,
    dispatch_limit: Semaphore,
    state: Mutex<State>,
}

/// Shared, cloneable handle to the batch's result aggregator
#[derive(Clone)]
pub struct ResultAggregator {
    inner: Arc<Inner>,
}

impl ResultAggregator {
    pub fn new(batch: Batch, backend: Arc<dyn VisualBackend>, config: &SuiteConfig) -> Self {
        let requested = config.concurrency.max(1);
        let concurrency = match backend.concurrency_cap() {
            Some(cap) if cap.max(1) < requested => {
                debug!(
                    "Backend limits concurrency to {} (requested {})",
                    cap.max(1),
                    requested
                );
                cap.max(1)
            }
            _ => requested,
        };

        info!(
            "Batch '{}' ({}) created, concurrency {}",
            batch.display_name, batch.id, concurrency
        );

        Self {
            inner: Arc::new(Inner {
                batch,
                backend,
                api_key: config.api_key.clone(),
                concurrency,
                dispatch_limit: Semaphore::new(concurrency),
                state: Mutex::new(State {
                    phase: BatchState::Created,
                    next_execution: 0,
                    executions: BTreeMap::new(),
                    jobs: Vec::new(),
                }),
            }),
        }
    }

    pub fn batch(&self) -> &Batch {
        &self.inner.batch
    }

    pub fn phase(&self) -> BatchState {
        self.inner.state.lock().phase
    }

    /// Concurrency actually used for dispatch; may be below the configured value
    pub fn effective_concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Comparison jobs sent to the backend so far
    pub fn dispatched_jobs(&self) -> usize {
        self.inner
            .state
            .lock()
            .jobs
            .iter()
            .filter(|r| r.job.is_some())
            .count()
    }

    /// Snapshot of every result so far, ordered by execution then submission
    pub fn results(&self) -> Vec<TestResult> {
        self.inner.state.lock().results()
    }

    pub fn open_execution(&self, info: ExecutionInfo) -> HarnessResult<ExecutionId> {
        let mut state = self.inner.state.lock();
        if state.phase == BatchState::Closed {
            return Err(HarnessError::InvalidState(format!(
                "batch '{}' is closed",
                self.inner.batch.display_name
            )));
        }

        state.next_execution += 1;
        let id = ExecutionId(state.next_execution);
        debug!("Execution {} opened for '{}'", id, info.test_name);
        state.executions.insert(
            id,
            Execution {
                info,
                open: true,
                checkpoints: Vec::new(),
            },
        );
        state.advance(BatchState::Open);
        Ok(id)
    }

    /// Accept a checkpoint from an open execution
    pub fn submit(&self, checkpoint: Checkpoint) -> HarnessResult<()> {
        let mut state = self.inner.state.lock();
        if state.phase == BatchState::Closed {
            return Err(HarnessError::InvalidState(format!(
                "cannot submit '{}': batch is closed",
                checkpoint.name()
            )));
        }

        let id = checkpoint.execution();
        let execution = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| HarnessError::InvalidState(format!("unknown execution {}", id)))?;

        if !execution.open {
            return Err(HarnessError::InvalidState(format!(
                "cannot submit '{}': execution {} is closed",
                checkpoint.name(),
                id
            )));
        }

        if execution.checkpoints.iter().any(|c| c.name() == checkpoint.name()) {
            return Err(HarnessError::DuplicateCheckpoint {
                name: checkpoint.name().to_string(),
            });
        }

        debug!("Checkpoint '{}' submitted by execution {}", checkpoint.name(), id);
        execution.checkpoints.push(checkpoint);
        state.advance(BatchState::Collecting);
        Ok(())
    }

    /// Close every open execution of `test_name` without dispatching it
    ///
    /// For executions whose task died before teardown. Their checkpoints are
    /// dropped so the rest of the batch can still be finalized. Returns the
    /// executions that were closed.
    pub fn abandon_executions(&self, test_name: &str) -> Vec<ExecutionId> {
        let mut state = self.inner.state.lock();
        let mut abandoned = Vec::new();
        for (id, execution) in state.executions.iter_mut() {
            if execution.open && execution.info.test_name == test_name {
                warn!(
                    "Abandoning execution {} of '{}' with {} checkpoint(s)",
                    id,
                    test_name,
                    execution.checkpoints.len()
                );
                execution.open = false;
                execution.checkpoints.clear();
                abandoned.push(*id);
            }
        }
        abandoned
    }

    /// End an execution and dispatch its checkpoints
    ///
    /// Without targets every checkpoint resolves locally as passed. With
    /// targets, one run per target is opened on the backend and each
    /// checkpoint is submitted to it. Dispatch failures are recorded as
    /// failed verdicts and reported in the returned error.
    pub async fn close_execution(&self, id: ExecutionId) -> HarnessResult<()> {
        let (info, checkpoints) = {
            let mut state = self.inner.state.lock();
            if state.phase == BatchState::Closed {
                return Err(HarnessError::InvalidState(format!(
                    "cannot close execution {}: batch is closed",
                    id
                )));
            }

            let execution = state
                .executions
                .get_mut(&id)
                .ok_or_else(|| HarnessError::InvalidState(format!("unknown execution {}", id)))?;
            if !execution.open {
                return Err(HarnessError::InvalidState(format!(
                    "execution {} is already closed",
                    id
                )));
            }
            execution.open = false;
            (execution.info.clone(), execution.checkpoints.clone())
        };

        let targets: TargetSet = checkpoints
            .iter()
            .flat_map(|c| c.targets().iter().cloned())
            .collect();

        // Record every (checkpoint, target) pair before anything is sent
        let plan: Vec<(TargetDescriptor, Vec<(usize, Checkpoint)>)> = {
            let mut state = self.inner.state.lock();
            for (sequence, c) in checkpoints.iter().enumerate() {
                if c.targets().is_empty() {
                    state.jobs.push(JobRecord {
                        execution: id,
                        sequence,
                        checkpoint_name: c.name().to_string(),
                        target: RenderTarget::Local,
                        job: None,
                        status: JobStatus {
                            verdict: Verdict::Passed,
                            diff: None,
                        },
                    });
                }
            }

            let mut plan: Vec<(TargetDescriptor, Vec<(usize, Checkpoint)>)> =
                targets.iter().map(|t| (t.clone(), Vec::new())).collect();
            for (sequence, c) in checkpoints.iter().enumerate() {
                for (target, entries) in plan.iter_mut() {
                    if c.targets().contains(target) {
                        let index = state.jobs.len();
                        state.jobs.push(JobRecord {
                            execution: id,
                            sequence,
                            checkpoint_name: c.name().to_string(),
                            target: RenderTarget::Remote(target.clone()),
                            job: None,
                            status: JobStatus::unresolved(),
                        });
                        entries.push((index, c.clone()));
                    }
                }
            }

            state.advance(if plan.is_empty() {
                BatchState::Collecting
            } else {
                BatchState::Dispatching
            });
            plan
        };

        if plan.is_empty() {
            debug!(
                "Execution {} closed with {} local checkpoint(s)",
                id,
                checkpoints.len()
            );
            return Ok(());
        }

        info!(
            "Dispatching {} checkpoint(s) of '{}' to {} target(s)",
            checkpoints.len(),
            info.test_name,
            plan.len()
        );

        let errors: Vec<String> = join_all(
            plan.into_iter()
                .map(|(target, entries)| self.dispatch_run(&info, target, entries)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Backend(errors.join("; ")))
        }
    }

    /// Open one backend run for `target` and submit its checkpoints in order
    async fn dispatch_run(
        &self,
        info: &ExecutionInfo,
        target: TargetDescriptor,
        entries: Vec<(usize, Checkpoint)>,
    ) -> Vec<String> {
        let mut errors = Vec::new();

        let _permit = match self.inner.dispatch_limit.acquire().await {
            Ok(p) => p,
            Err(e) => {
                let reason = format!("dispatch to {} aborted: {}", target, e);
                self.fail_records(entries.iter().map(|(i, _)| *i), &reason);
                errors.push(reason);
                return errors;
            }
        };

        let run_config = RunConfig {
            api_key: self.inner.api_key.clone(),
            app_name: info.app_name.clone(),
            test_name: info.test_name.clone(),
            viewport: info.viewport,
            batch_id: self.inner.batch.id.clone(),
            target: target.clone(),
        };

        let backend = &self.inner.backend;
        let run = match backend.open_run(&run_config).await {
            Ok(run) => run,
            Err(e) => {
                let reason = format!("cannot open run on {}: {}", target, e);
                warn!("{}", reason);
                self.fail_records(entries.iter().map(|(i, _)| *i), &reason);
                errors.push(reason);
                return errors;
            }
        };

        for (index, checkpoint) in &entries {
            match backend
                .submit_checkpoint(&run, checkpoint.name(), checkpoint.snapshot(), checkpoint.match_strategy())
                .await
            {
                Ok(job) => {
                    debug!("'{}' on {} -> job {}", checkpoint.name(), target, job);
                    self.inner.state.lock().jobs[*index].job = Some(job);
                }
                Err(e) => {
                    let reason = format!("cannot submit '{}' to {}: {}", checkpoint.name(), target, e);
                    warn!("{}", reason);
                    self.fail_records(std::iter::once(*index), &reason);
                    errors.push(reason);
                }
            }
        }

        if let Err(e) = backend.close_run(&run).await {
            let reason = format!("cannot close run on {}: {}", target, e);
            warn!("{}", reason);
            errors.push(reason);
        }

        errors
    }

    fn fail_records(&self, indices: impl Iterator<Item = usize>, reason: &str) {
        let mut state = self.inner.state.lock();
        for i in indices {
            state.jobs[i].status = JobStatus {
                verdict: Verdict::Failed,
                diff: Some(format!("dispatch failed: {}", reason)),
            };
        }
    }

    /// Refresh unresolved jobs without blocking on the backend's completion
    ///
    /// With `fail_on_diff = false` this never fails because of verdicts or
    /// backend poll errors; those are logged and left unresolved.
    pub async fn poll_results(&self, fail_on_diff: bool) -> HarnessResult<Vec<TestResult>> {
        let pending = {
            let mut state = self.inner.state.lock();
            if !state.jobs.is_empty() {
                state.advance(BatchState::Resolving);
            }
            state.pending()
        };

        for (index, job) in pending {
            match self.inner.backend.poll_job(&job).await {
                Ok(status) if status.is_resolved() => {
                    self.inner.state.lock().jobs[index].status = status;
                }
                Ok(_) => {}
                Err(e) => warn!("Polling job {} failed: {}", job, e),
            }
        }

        let results = self.results();
        if fail_on_diff {
            check_failures(&results)?;
        }
        Ok(results)
    }

    /// Block until every dispatched job resolves, then close the batch
    ///
    /// Fails with `VisualDiff` listing every failed (checkpoint, target) pair,
    /// or with `ResultTimeout` if `timeout` elapses first. A timed-out batch
    /// stays open so the wait can be retried.
    pub async fn await_all_results(&self, timeout: Option<Duration>) -> HarnessResult<Vec<TestResult>> {
        {
            let mut state = self.inner.state.lock();
            let open: Vec<String> = state
                .executions
                .iter()
                .filter(|(_, e)| e.open)
                .map(|(id, e)| format!("{} '{}'", id, e.info.test_name))
                .collect();
            if !open.is_empty() {
                return Err(HarnessError::InvalidState(format!(
                    "cannot finalize batch while executions are open: {}",
                    open.join(", ")
                )));
            }
            state.advance(BatchState::Resolving);
        }

        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);

        loop {
            let pending = self.inner.state.lock().pending().len();
            if pending == 0 {
                break;
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                warn!("{} comparison job(s) still unresolved after {:?}", pending, start.elapsed());
                return Err(HarnessError::ResultTimeout {
                    pending,
                    elapsed: start.elapsed(),
                });
            }

            debug!("Waiting for {} comparison job(s)", pending);
            let backend = &self.inner.backend;
            let batch_id = &self.inner.batch.id;
            let outcomes = match remaining {
                Some(r) => match tokio::time::timeout(r, backend.await_batch(batch_id, Some(r))).await {
                    Ok(outcomes) => outcomes?,
                    Err(_) => Vec::new(),
                },
                None => backend.await_batch(batch_id, None).await?,
            };

            let progressed = self.inner.state.lock().apply(&outcomes);
            if progressed == 0 {
                self.poll_results(false).await?;
                let pause = remaining.map_or(POLL_INTERVAL, |r| r.min(POLL_INTERVAL));
                tokio::time::sleep(pause).await;
            }
        }

        let results = {
            let mut state = self.inner.state.lock();
            state.phase = BatchState::Closed;
            state.results()
        };

        info!(
            "Batch '{}' closed with {} result(s)",
            self.inner.batch.display_name,
            results.len()
        );
        check_failures(&results)?;
        Ok(results)
    }
}

fn check_failures(results: &[TestResult]) -> HarnessResult<()> {
    let failures: Vec<_> = results
        .iter()
        .filter(|r| r.is_failed())
        .map(|r| r.to_failure())
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::VisualDiff { failures })
    }
}
