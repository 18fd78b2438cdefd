//! Job bookkeeping shared by the bundled backends

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{JobId, JobOutcome, JobStatus};

/// Tracks job status per batch and wakes waiters when a job resolves
#[derive(Default)]
pub(crate) struct JobBoard {
    // job -> (batch id, status, submission order)
    jobs: Mutex<HashMap<JobId, (String, JobStatus, u64)>>,
    seq: Mutex<u64>,
    resolved: Notify,
}

impl JobBoard {
    pub fn register(&self, batch_id: &str, job: JobId) {
        let seq = {
            let mut seq = self.seq.lock();
            *seq += 1;
            *seq
        };
        self.jobs
            .lock()
            .insert(job, (batch_id.to_string(), JobStatus::unresolved(), seq));
    }

    pub fn resolve(&self, job: &JobId, status: JobStatus) {
        if let Some(entry) = self.jobs.lock().get_mut(job) {
            entry.1 = status;
        }
        self.resolved.notify_waiters();
    }

    pub fn status(&self, job: &JobId) -> Option<JobStatus> {
        self.jobs.lock().get(job).map(|(_, s, _)| s.clone())
    }

    pub fn unresolved(&self) -> Vec<JobId> {
        self.jobs
            .lock()
            .iter()
            .filter(|(_, (_, s, _))| !s.is_resolved())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn all_resolved(&self, batch_id: &str) -> bool {
        self.jobs
            .lock()
            .values()
            .filter(|(b, _, _)| b == batch_id)
            .all(|(_, s, _)| s.is_resolved())
    }

    /// Outcomes of the batch's jobs in submission order
    pub fn outcomes(&self, batch_id: &str) -> Vec<JobOutcome> {
        let jobs = self.jobs.lock();
        let mut outcomes: Vec<_> = jobs
            .iter()
            .filter(|(_, (b, _, _))| b == batch_id)
            .map(|(id, (_, status, seq))| (*seq, JobOutcome { job: id.clone(), status: status.clone() }))
            .collect();
        outcomes.sort_by_key(|(seq, _)| *seq);
        outcomes.into_iter().map(|(_, o)| o).collect()
    }

    /// Wait until every job of the batch resolved, or until `timeout`
    pub async fn wait_for_batch(&self, batch_id: &str, timeout: Option<Duration>) -> Vec<JobOutcome> {
        let wait = async {
            loop {
                // Created before the check so a resolve in between is not missed
                let notified = self.resolved.notified();
                if self.all_resolved(batch_id) {
                    break;
                }
                notified.await;
            }
        };

        match timeout {
            Some(t) => {
                let _ = tokio::time::timeout(t, wait).await;
            }
            None => wait.await,
        }

        self.outcomes(batch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Verdict;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_wakes_on_resolve() {
        let board = Arc::new(JobBoard::default());
        let job = JobId("j1".to_string());
        board.register("b", job.clone());

        let waiter = {
            let board = board.clone();
            tokio::spawn(async move { board.wait_for_batch("b", None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        board.resolve(
            &job,
            JobStatus {
                verdict: Verdict::Passed,
                diff: None,
            },
        );

        let outcomes = waiter.await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status.verdict, Verdict::Passed);
    }

    #[tokio::test]
    async fn test_wait_times_out_with_unresolved() {
        let board = JobBoard::default();
        board.register("b", JobId("j1".to_string()));

        let outcomes = board.wait_for_batch("b", Some(Duration::from_millis(20))).await;
        assert_eq!(outcomes[0].status.verdict, Verdict::Unresolved);
    }
}
