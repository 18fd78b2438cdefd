//! Checkpoint capture

use std::collections::HashSet;

use tracing::debug;

use crate::aggregator::ResultAggregator;
use crate::batch::ExecutionId;
use crate::checkpoint::{Checkpoint, MatchStrategy, Snapshot};
use crate::driver::CaptureArea;
use crate::error::{HarnessError, HarnessResult};
use crate::session::SessionHandle;
use crate::target::TargetSet;

/// Captures checkpoints for one execution and hands them to the aggregator
pub struct CheckpointRecorder {
    aggregator: ResultAggregator,
    execution: ExecutionId,
    targets: TargetSet,
    captured: HashSet<String>,
}

impl CheckpointRecorder {
    pub fn new(aggregator: ResultAggregator, execution: ExecutionId, targets: TargetSet) -> Self {
        Self {
            aggregator,
            execution,
            targets,
            captured: HashSet::new(),
        }
    }

    pub fn execution(&self) -> ExecutionId {
        self.execution
    }

    /// Checkpoints captured so far
    pub fn captured(&self) -> usize {
        self.captured.len()
    }

    /// Screenshot the page (or `region` of it) and submit it as checkpoint `name`
    ///
    /// Names are checked before anything is captured, so a rejected
    /// checkpoint never reaches the aggregator.
    pub async fn capture(
        &mut self,
        session: &SessionHandle,
        name: &str,
        strategy: MatchStrategy,
        region: Option<&str>,
    ) -> HarnessResult<Checkpoint> {
        if name.trim().is_empty() {
            return Err(HarnessError::Validation("checkpoint name must not be empty".to_string()));
        }
        if !session.is_open() {
            return Err(HarnessError::InvalidState(format!(
                "cannot capture '{}': session for '{}' is closed",
                name,
                session.test_name()
            )));
        }
        if self.captured.contains(name) {
            return Err(HarnessError::DuplicateCheckpoint { name: name.to_string() });
        }

        let area = region.map_or(CaptureArea::FullPage, CaptureArea::Region);
        let png = session
            .screenshot(area)
            .await
            .map_err(|e| HarnessError::interaction(format!("checkpoint:{}", name), e))?;

        let mut checkpoint = Checkpoint::new(
            self.execution,
            name,
            strategy,
            Snapshot::from_png(png),
            self.targets.clone(),
        )?;
        if let Some(selector) = region {
            checkpoint = checkpoint.with_region(selector);
        }

        self.aggregator.submit(checkpoint.clone())?;
        self.captured.insert(name.to_string());

        debug!(
            "Captured '{}' for {} ({:?}, {})",
            name,
            self.execution,
            strategy,
            checkpoint.snapshot().digest()
        );
        Ok(checkpoint)
    }
}
