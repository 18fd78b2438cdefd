//! Suite configuration
//!
//! A `SuiteConfig` is built once per suite run, validated, and then shared
//! read-only (behind an `Arc`) with every execution.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{HarnessError, HarnessResult};
use crate::target::{BrowserType, DeviceName, Orientation, TargetDescriptor, TargetSet, Viewport};

pub const ENV_API_KEY: &str = "VISUAL_API_KEY";
pub const ENV_HEADLESS: &str = "HEADLESS";
pub const ENV_CONCURRENCY: &str = "VISUAL_CONCURRENCY";
pub const ENV_RESULT_TIMEOUT_MS: &str = "VISUAL_RESULT_TIMEOUT_MS";

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Key for the comparison backend
    pub api_key: String,

    /// Application under test, shown in reports
    pub app_name: String,

    /// Display name of the batch
    pub batch_name: String,

    /// Run the local browser headless
    pub headless: bool,

    /// Requested number of parallel comparison runs
    pub concurrency: usize,

    /// Remote render targets (empty = local verification only)
    #[serde(deserialize_with = "deserialize_targets")]
    pub targets: TargetSet,

    /// Viewport of the local browser
    pub viewport: Viewport,

    /// Upper bound for the end-of-suite wait
    #[serde(rename = "result_timeout_ms", deserialize_with = "deserialize_timeout")]
    pub result_timeout: Option<Duration>,

    /// Where reports are written
    pub output_dir: PathBuf,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            app_name: "App".to_string(),
            batch_name: "uicheck suite".to_string(),
            headless: false,
            concurrency: 1,
            targets: TargetSet::new(),
            viewport: Viewport::default(),
            result_timeout: None,
            output_dir: PathBuf::from("test-results"),
        }
    }
}

// Keeps the api key out of logs.
impl fmt::Debug for SuiteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteConfig")
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("app_name", &self.app_name)
            .field("batch_name", &self.batch_name)
            .field("headless", &self.headless)
            .field("concurrency", &self.concurrency)
            .field("targets", &self.targets)
            .field("viewport", &self.viewport)
            .field("result_timeout", &self.result_timeout)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

impl SuiteConfig {
    /// Load configuration from a YAML file, then apply environment overrides
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> HarnessResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> HarnessResult<()> {
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            self.api_key = key;
        }

        if let Ok(headless) = std::env::var(ENV_HEADLESS) {
            self.headless = headless.eq_ignore_ascii_case("true");
        }

        if let Ok(c) = std::env::var(ENV_CONCURRENCY) {
            self.concurrency = c.trim().parse().map_err(|_| {
                HarnessError::Config(format!("{} must be a positive integer, got '{}'", ENV_CONCURRENCY, c))
            })?;
        }

        if let Ok(ms) = std::env::var(ENV_RESULT_TIMEOUT_MS) {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                HarnessError::Config(format!("{} must be milliseconds, got '{}'", ENV_RESULT_TIMEOUT_MS, ms))
            })?;
            self.result_timeout = Some(Duration::from_millis(ms));
        }

        Ok(())
    }

    /// Check invariants the rest of the harness relies on
    pub fn validate(&self) -> HarnessResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(HarnessError::Config(format!(
                "api key is required (set {} or api_key)",
                ENV_API_KEY
            )));
        }

        if self.concurrency == 0 {
            return Err(HarnessError::Validation(
                "concurrency must be at least 1".to_string(),
            ));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(HarnessError::Validation(format!(
                "viewport must have a positive size, got {}",
                self.viewport
            )));
        }

        for t in self.targets.iter() {
            let v = t.viewport();
            TargetDescriptor::new(t.kind(), t.identifier(), v.width, v.height, t.orientation())?;
        }

        Ok(())
    }

    /// Whether checkpoints are only verified locally
    pub fn is_local_only(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Target as written in a config file
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetEntry {
    Browser {
        browser: BrowserType,
        width: u32,
        height: u32,
    },
    Device {
        device: String,
        #[serde(default = "default_orientation")]
        orientation: Orientation,
    },
}

fn default_orientation() -> Orientation {
    Orientation::Portrait
}

impl TargetEntry {
    pub fn into_descriptor(self) -> HarnessResult<TargetDescriptor> {
        match self {
            TargetEntry::Browser { browser, width, height } => {
                TargetDescriptor::browser(width, height, browser)
            }
            TargetEntry::Device { device, orientation } => {
                let name = DeviceName::from_name(&device).ok_or_else(|| {
                    HarnessError::Validation(format!("unknown device '{}'", device))
                })?;
                TargetDescriptor::device(name, orientation)
            }
        }
    }
}

fn deserialize_targets<'de, D>(deserializer: D) -> Result<TargetSet, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<TargetEntry>::deserialize(deserializer)?;
    entries
        .into_iter()
        .map(|e| e.into_descriptor().map_err(serde::de::Error::custom))
        .collect()
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}
