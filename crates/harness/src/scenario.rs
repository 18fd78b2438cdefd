//! Declarative YAML scenarios

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checkpoint::MatchStrategy;
use crate::error::{HarnessError, HarnessResult};
use crate::lifecycle::{ExecutionContext, Scenario};
use crate::target::Viewport;

/// A scenario parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Test name, unique within a suite
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Tags for filtering
    #[serde(default)]
    pub tags: Vec<String>,

    /// Overrides the configured application name
    #[serde(default)]
    pub app_name: Option<String>,

    /// Overrides the configured viewport
    #[serde(default)]
    pub viewport: Option<Viewport>,

    /// Steps to execute in order
    pub steps: Vec<ScenarioStep>,
}

/// A single step of a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScenarioStep {
    Navigate {
        url: String,
        #[serde(default)]
        wait_for_selector: Option<String>,
    },

    Fill {
        selector: String,
        value: String,
    },

    Click {
        selector: String,
    },

    /// Wait for an element to appear
    Wait {
        selector: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },

    /// Fixed pause (use sparingly)
    Sleep {
        ms: u64,
    },

    /// Capture a checkpoint of the page or of one element
    Checkpoint {
        name: String,
        #[serde(default)]
        match_strategy: MatchStrategy,
        #[serde(default)]
        region: Option<String>,
    },

    Log {
        message: String,
    },
}

fn default_wait_timeout() -> u64 {
    5000
}

impl ScenarioSpec {
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let spec: Self = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|e| match e {
            HarnessError::Validation(msg) => HarnessError::Validation(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Load every `.yaml`/`.yml` scenario under `dir`, sorted by name
    pub fn load_all(dir: &Path) -> HarnessResult<Vec<Self>> {
        let mut specs = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            specs.push(Self::from_file(entry.path())?);
        }

        specs.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in specs.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(HarnessError::Validation(format!(
                    "scenario name '{}' is used more than once",
                    pair[0].name
                )));
            }
        }

        Ok(specs)
    }

    pub fn filter_by_tag<'a>(specs: &'a [Self], tag: &str) -> Vec<&'a Self> {
        specs.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    fn validate(&self) -> HarnessResult<()> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::Validation("scenario name must not be empty".to_string()));
        }
        if let Some(v) = self.viewport {
            if v.width == 0 || v.height == 0 {
                return Err(HarnessError::Validation(format!(
                    "scenario '{}' has an empty viewport {}",
                    self.name, v
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Scenario for ScenarioSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    async fn run(&self, ctx: &mut ExecutionContext<'_>) -> HarnessResult<()> {
        for step in &self.steps {
            match step {
                ScenarioStep::Navigate { url, wait_for_selector } => {
                    ctx.navigate(url).await?;
                    if let Some(selector) = wait_for_selector {
                        ctx.wait_for(selector, default_wait_timeout()).await?;
                    }
                }
                ScenarioStep::Fill { selector, value } => ctx.fill(selector, value).await?,
                ScenarioStep::Click { selector } => ctx.click(selector).await?,
                ScenarioStep::Wait { selector, timeout_ms } => ctx.wait_for(selector, *timeout_ms).await?,
                ScenarioStep::Sleep { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
                ScenarioStep::Checkpoint {
                    name,
                    match_strategy,
                    region: Some(selector),
                } => {
                    ctx.check_region(name, selector, *match_strategy).await?;
                }
                ScenarioStep::Checkpoint {
                    name,
                    match_strategy,
                    region: None,
                } => {
                    ctx.check(name, *match_strategy).await?;
                }
                ScenarioStep::Log { message } => info!("[{}] {}", self.name, message),
            }
        }
        Ok(())
    }
}
