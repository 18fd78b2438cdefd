//! Checkpoints and the snapshots they carry

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::batch::ExecutionId;
use crate::error::{HarnessError, HarnessResult};
use crate::target::TargetSet;

/// How strictly a checkpoint is compared against its baseline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Pixel-exact
    #[default]
    Exact,
    /// Tolerates content changes that keep the page structure
    Layout,
    /// Exact comparison restricted to a captured region
    Region,
}

/// Captured PNG content, cheap to clone
#[derive(Clone)]
pub struct Snapshot {
    data: Arc<[u8]>,
    digest: String,
}

impl Snapshot {
    pub fn from_png(bytes: Vec<u8>) -> Self {
        let digest = hex::encode(Sha256::digest(&bytes));
        Self {
            data: bytes.into(),
            digest,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// SHA-256 of the encoded bytes
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn decode(&self) -> HarnessResult<DynamicImage> {
        Ok(image::load_from_memory(&self.data)?)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("digest", &&self.digest[..12.min(self.digest.len())])
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A named snapshot awaiting verification. Immutable once built.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    execution: ExecutionId,
    name: String,
    match_strategy: MatchStrategy,
    region: Option<String>,
    snapshot: Snapshot,
    targets: TargetSet,
    captured_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        execution: ExecutionId,
        name: impl Into<String>,
        match_strategy: MatchStrategy,
        snapshot: Snapshot,
        targets: TargetSet,
    ) -> HarnessResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(HarnessError::Validation(
                "checkpoint name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            execution,
            name,
            match_strategy,
            region: None,
            snapshot,
            targets,
            captured_at: Utc::now(),
        })
    }

    /// Record the selector the snapshot was cropped to
    pub fn with_region(mut self, selector: impl Into<String>) -> Self {
        self.region = Some(selector.into());
        self
    }

    pub fn execution(&self) -> ExecutionId {
        self.execution
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn match_strategy(&self) -> MatchStrategy {
        self.match_strategy
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Remote targets; empty means local verification only
    pub fn targets(&self) -> &TargetSet {
        &self.targets
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_rejected() {
        let snap = Snapshot::from_png(vec![1, 2, 3]);
        let err = Checkpoint::new(ExecutionId(1), "  ", MatchStrategy::Exact, snap, TargetSet::new());
        assert!(matches!(err, Err(HarnessError::Validation(_))));
    }

    #[test]
    fn test_checkpoint_records_capture_time() {
        let before = Utc::now();
        let c = Checkpoint::new(
            ExecutionId(1),
            "Login Window",
            MatchStrategy::Exact,
            Snapshot::from_png(vec![1, 2, 3]),
            TargetSet::new(),
        )
        .unwrap();
        assert!(c.captured_at() >= before);
        assert!(c.captured_at() <= Utc::now());
    }

    #[test]
    fn test_snapshot_digest_is_content_addressed() {
        let a = Snapshot::from_png(b"same".to_vec());
        let b = Snapshot::from_png(b"same".to_vec());
        let c = Snapshot::from_png(b"other".to_vec());
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
