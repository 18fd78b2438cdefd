//! Batches and executions

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::target::Viewport;

/// Groups every checkpoint of one suite run
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: String,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            started_at: Utc::now(),
        }
    }
}

/// Lifecycle of a batch inside the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Created,
    Open,
    Collecting,
    Dispatching,
    Resolving,
    Closed,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Created => "created",
            BatchState::Open => "open",
            BatchState::Collecting => "collecting",
            BatchState::Dispatching => "dispatching",
            BatchState::Resolving => "resolving",
            BatchState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Identifies one execution within a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the aggregator needs to know about an execution
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    pub test_name: String,
    pub app_name: String,
    pub viewport: Viewport,
}
