//! Error types for the checkpoint harness

use std::time::Duration;

use thiserror::Error;

use crate::result::FailedCheckpoint;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session failed to open: {0}")]
    SessionOpen(String),

    #[error("Automation driver failed to launch: {0}")]
    DriverLaunch(String),

    #[error("Driver error: {reason}")]
    Driver { reason: String },

    #[error("Checkpoint '{name}' was already captured in this execution")]
    DuplicateCheckpoint { name: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Interaction failed: {step} - {reason}")]
    Interaction { step: String, reason: String },

    #[error("Visual differences found in {} checkpoint(s): {}", failures.len(), format_failures(failures))]
    VisualDiff { failures: Vec<FailedCheckpoint> },

    #[error("Timed out after {elapsed:?} with {pending} comparison job(s) unresolved")]
    ResultTimeout { pending: usize, elapsed: Duration },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl HarnessError {
    /// Shorthand for a driver failure
    pub fn driver(reason: impl Into<String>) -> Self {
        HarnessError::Driver { reason: reason.into() }
    }

    /// Shorthand for a failed interaction step
    pub fn interaction(step: impl Into<String>, reason: impl ToString) -> Self {
        HarnessError::Interaction {
            step: step.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error reports a visual mismatch rather than a broken run
    pub fn is_visual_diff(&self) -> bool {
        matches!(self, HarnessError::VisualDiff { .. })
    }
}

fn format_failures(failures: &[FailedCheckpoint]) -> String {
    failures
        .iter()
        .map(|f| format!("'{}' on {}", f.checkpoint_name, f.target))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type HarnessResult<T> = Result<T, HarnessError>;
