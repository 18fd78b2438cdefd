//! Suite runner: one batch, many concurrent executions

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::aggregator::ResultAggregator;
use crate::backend::VisualBackend;
use crate::batch::Batch;
use crate::config::SuiteConfig;
use crate::driver::{AutomationDriver, Browser};
use crate::error::{HarnessError, HarnessResult};
use crate::lifecycle::{Scenario, TestLifecycle};
use crate::result::{ExecutionSummary, SuiteReport};
use crate::scenario::ScenarioSpec;

pub struct SuiteRunner {
    config: Arc<SuiteConfig>,
    driver: Arc<dyn AutomationDriver>,
    backend: Arc<dyn VisualBackend>,
    browser: Browser,
}

impl SuiteRunner {
    pub fn new(
        config: SuiteConfig,
        driver: Arc<dyn AutomationDriver>,
        backend: Arc<dyn VisualBackend>,
    ) -> HarnessResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            driver,
            backend,
            browser: Browser::default(),
        })
    }

    pub fn with_browser(mut self, browser: Browser) -> Self {
        self.browser = browser;
        self
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    /// Run every scenario as its own execution of a fresh batch
    ///
    /// Visual differences are part of the report, not an error. A result
    /// timeout is returned as `ResultTimeout`.
    pub async fn run(&self, scenarios: Vec<Arc<dyn Scenario>>) -> HarnessResult<SuiteReport> {
        let start = Instant::now();
        let batch = Batch::new(self.config.batch_name.clone());
        let aggregator = ResultAggregator::new(batch.clone(), self.backend.clone(), &self.config);
        let lifecycle = Arc::new(
            TestLifecycle::new(self.config.clone(), self.driver.clone(), aggregator.clone())
                .with_browser(self.browser),
        );

        if self.config.is_local_only() {
            info!("Running {} scenario(s) locally...", scenarios.len());
        } else {
            info!(
                "Running {} scenario(s) against {} target(s)...",
                scenarios.len(),
                self.config.targets.len()
            );
        }

        let tasks: Vec<_> = scenarios
            .into_iter()
            .map(|scenario| {
                let lifecycle = lifecycle.clone();
                let name = scenario.name().to_string();
                let task = tokio::spawn(async move { lifecycle.run_execution(scenario.as_ref()).await });
                (name, task)
            })
            .collect();

        let mut executions = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            let summary = match task.await {
                Ok(outcome) => {
                    if outcome.is_success() {
                        info!("✓ {} ({} ms)", outcome.test_name, outcome.duration.as_millis());
                    }
                    outcome.summary()
                }
                Err(e) => {
                    error!("✗ {} - execution task failed: {}", name, e);
                    let abandoned = aggregator.abandon_executions(&name);
                    ExecutionSummary {
                        execution: abandoned.first().copied(),
                        test_name: name,
                        success: false,
                        duration_ms: 0,
                        error: Some(format!("execution task failed: {}", e)),
                        teardown_errors: Vec::new(),
                    }
                }
            };
            executions.push(summary);
        }

        let results = match aggregator.await_all_results(self.config.result_timeout).await {
            Ok(results) => results,
            Err(HarnessError::VisualDiff { failures }) => {
                warn!("{} checkpoint(s) differ from their baselines", failures.len());
                aggregator.results()
            }
            Err(e) => return Err(e),
        };

        let report = SuiteReport::new(batch, executions, results, start.elapsed().as_millis() as u64);
        report.log_summary();
        Ok(report)
    }

    pub async fn run_specs(&self, specs: Vec<ScenarioSpec>) -> HarnessResult<SuiteReport> {
        let scenarios = specs
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn Scenario>)
            .collect();
        self.run(scenarios).await
    }

    /// Run every scenario file under `dir`
    pub async fn run_dir(&self, dir: &Path) -> HarnessResult<SuiteReport> {
        self.run_specs(ScenarioSpec::load_all(dir)?).await
    }

    /// Run the scenarios under `dir` carrying `tag`
    pub async fn run_tagged(&self, dir: &Path, tag: &str) -> HarnessResult<SuiteReport> {
        let specs = ScenarioSpec::load_all(dir)?;
        let tagged = ScenarioSpec::filter_by_tag(&specs, tag)
            .into_iter()
            .cloned()
            .collect();
        self.run_specs(tagged).await
    }

    /// Run the one scenario under `dir` named `name`
    pub async fn run_named(&self, dir: &Path, name: &str) -> HarnessResult<SuiteReport> {
        let spec = ScenarioSpec::load_all(dir)?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| HarnessError::Validation(format!("Scenario not found: {}", name)))?;
        self.run_specs(vec![spec]).await
    }

    /// Write the report to `test-results.json` in the configured output directory
    pub fn write_results(&self, report: &SuiteReport) -> HarnessResult<PathBuf> {
        report.write_json(&self.config.output_dir)
    }
}
