//! Per-execution lifecycle
//!
//! Every scenario runs as one execution:
//!
//! ```text
//! launch driver -> open execution -> open session -> run scenario
//!                                                        |
//!        poll_results(false) <- close session <- close_execution
//! ```
//!
//! The teardown steps always run, in that order, whatever happened before
//! them. Their errors are logged and collected on the outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::aggregator::ResultAggregator;
use crate::batch::{ExecutionId, ExecutionInfo};
use crate::checkpoint::{Checkpoint, MatchStrategy};
use crate::config::SuiteConfig;
use crate::driver::{AutomationDriver, Browser, LaunchOptions};
use crate::error::{HarnessError, HarnessResult};
use crate::recorder::CheckpointRecorder;
use crate::result::{ExecutionSummary, TestResult};
use crate::session::SessionHandle;
use crate::target::Viewport;

/// A UI flow that captures checkpoints
#[async_trait]
pub trait Scenario: Send + Sync {
    /// Test name, unique within a suite
    fn name(&self) -> &str;

    /// Overrides the configured application name
    fn app_name(&self) -> Option<&str> {
        None
    }

    /// Overrides the configured viewport
    fn viewport(&self) -> Option<Viewport> {
        None
    }

    async fn run(&self, ctx: &mut ExecutionContext<'_>) -> HarnessResult<()>;
}

/// What a running scenario can do with its session
pub struct ExecutionContext<'a> {
    session: &'a SessionHandle,
    recorder: &'a mut CheckpointRecorder,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(session: &'a SessionHandle, recorder: &'a mut CheckpointRecorder) -> Self {
        Self { session, recorder }
    }

    pub fn execution(&self) -> ExecutionId {
        self.recorder.execution()
    }

    pub fn session(&self) -> &SessionHandle {
        self.session
    }

    pub async fn navigate(&self, url: &str) -> HarnessResult<()> {
        debug!("navigate {}", url);
        self.session.navigate(url).await
    }

    pub async fn fill(&self, selector: &str, value: &str) -> HarnessResult<()> {
        debug!("fill {}", selector);
        self.session.fill(selector, value).await
    }

    pub async fn click(&self, selector: &str) -> HarnessResult<()> {
        debug!("click {}", selector);
        self.session.click(selector).await
    }

    pub async fn wait_for(&self, selector: &str, timeout_ms: u64) -> HarnessResult<()> {
        self.session.wait_for_selector(selector, timeout_ms).await
    }

    /// Capture the whole page as checkpoint `name`
    pub async fn check(&mut self, name: &str, strategy: MatchStrategy) -> HarnessResult<Checkpoint> {
        self.recorder.capture(self.session, name, strategy, None).await
    }

    /// Capture the element matching `selector` as checkpoint `name`
    pub async fn check_region(
        &mut self,
        name: &str,
        selector: &str,
        strategy: MatchStrategy,
    ) -> HarnessResult<Checkpoint> {
        self.recorder
            .capture(self.session, name, strategy, Some(selector))
            .await
    }
}

/// How one execution went
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// `None` when the execution never registered (driver launch failed)
    pub execution: Option<ExecutionId>,
    pub test_name: String,
    pub error: Option<HarnessError>,
    pub teardown_errors: Vec<HarnessError>,
    /// Results known right after teardown; remote verdicts may still be unresolved
    pub results: Vec<TestResult>,
    pub duration: Duration,
}

impl ExecutionOutcome {
    fn aborted(test_name: String, error: HarnessError, start: Instant) -> Self {
        Self {
            execution: None,
            test_name,
            error: Some(error),
            teardown_errors: Vec::new(),
            results: Vec::new(),
            duration: start.elapsed(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.teardown_errors.is_empty()
    }

    /// The scenario error, else the first teardown error
    pub fn into_result(self) -> HarnessResult<Vec<TestResult>> {
        match (self.error, self.teardown_errors.into_iter().next()) {
            (Some(e), _) | (None, Some(e)) => Err(e),
            (None, None) => Ok(self.results),
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution: self.execution,
            test_name: self.test_name.clone(),
            success: self.is_success(),
            duration_ms: self.duration.as_millis() as u64,
            error: self.error.as_ref().map(|e| e.to_string()),
            teardown_errors: self.teardown_errors.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Runs scenarios as executions of one batch
pub struct TestLifecycle {
    config: Arc<SuiteConfig>,
    driver: Arc<dyn AutomationDriver>,
    aggregator: ResultAggregator,
    launch: LaunchOptions,
}

impl TestLifecycle {
    pub fn new(config: Arc<SuiteConfig>, driver: Arc<dyn AutomationDriver>, aggregator: ResultAggregator) -> Self {
        let launch = LaunchOptions {
            headless: config.headless,
            browser: Browser::default(),
        };
        Self {
            config,
            driver,
            aggregator,
            launch,
        }
    }

    pub fn with_browser(mut self, browser: Browser) -> Self {
        self.launch.browser = browser;
        self
    }

    pub fn aggregator(&self) -> &ResultAggregator {
        &self.aggregator
    }

    pub async fn run_execution(&self, scenario: &dyn Scenario) -> ExecutionOutcome {
        let start = Instant::now();
        let test_name = scenario.name().to_string();
        info!("Starting '{}'", test_name);

        let handle = match self.driver.launch(&self.launch).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("'{}' failed: {}", test_name, e);
                return ExecutionOutcome::aborted(test_name, e, start);
            }
        };

        let viewport = scenario.viewport().unwrap_or(self.config.viewport);
        let app_name = scenario.app_name().unwrap_or(self.config.app_name.as_str()).to_string();

        let execution = match self.aggregator.open_execution(ExecutionInfo {
            test_name: test_name.clone(),
            app_name: app_name.clone(),
            viewport,
        }) {
            Ok(id) => id,
            Err(e) => {
                error!("'{}' failed: {}", test_name, e);
                let mut outcome = ExecutionOutcome::aborted(test_name, e, start);
                if let Err(e) = self.driver.close(handle).await {
                    warn!("Teardown of '{}': {}", outcome.test_name, e);
                    outcome.teardown_errors.push(e);
                }
                return outcome;
            }
        };

        let mut recorder = CheckpointRecorder::new(self.aggregator.clone(), execution, self.config.targets.clone());
        let mut session: Option<SessionHandle> = None;

        // A panic anywhere between opening the session and the end of the
        // scenario still has to reach teardown
        let body = async {
            let opened = SessionHandle::open(self.driver.clone(), handle, &app_name, &test_name, viewport).await?;
            let session = session.insert(opened);
            let mut ctx = ExecutionContext::new(session, &mut recorder);
            scenario.run(&mut ctx).await
        };
        let ran = AssertUnwindSafe(body).catch_unwind().await;
        let failure = match ran {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => {
                let action = if session.is_some() { "scenario" } else { "session" };
                Some(HarnessError::interaction(action, panic_message(panic.as_ref())))
            }
        };

        if let Some(e) = &failure {
            error!("'{}' failed: {}", test_name, e);
        }

        let mut teardown_errors = Vec::new();

        if let Err(e) = self.aggregator.close_execution(execution).await {
            warn!("Teardown of '{}': {}", test_name, e);
            teardown_errors.push(e);
        }

        let closed = match session {
            Some(mut session) => session.close().await,
            None => self.driver.close(handle).await,
        };
        if let Err(e) = closed {
            warn!("Teardown of '{}': {}", test_name, e);
            teardown_errors.push(e);
        }

        let results = match self.aggregator.poll_results(false).await {
            Ok(results) => results.into_iter().filter(|r| r.execution == execution).collect(),
            Err(e) => {
                warn!("Teardown of '{}': {}", test_name, e);
                teardown_errors.push(e);
                Vec::new()
            }
        };

        let duration = start.elapsed();
        debug!(
            "'{}' finished in {} ms with {} checkpoint(s)",
            test_name,
            duration.as_millis(),
            recorder.captured()
        );

        ExecutionOutcome {
            execution: Some(execution),
            test_name,
            error: failure,
            teardown_errors,
            results,
            duration,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::batch::Batch;
    use crate::driver::ScriptedDriver;

    struct Noop;

    #[async_trait]
    impl Scenario for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn run(&self, _ctx: &mut ExecutionContext<'_>) -> HarnessResult<()> {
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Scenario for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn run(&self, _ctx: &mut ExecutionContext<'_>) -> HarnessResult<()> {
            panic!("boom")
        }
    }

    fn lifecycle(driver: Arc<ScriptedDriver>) -> TestLifecycle {
        let config = Arc::new(SuiteConfig {
            api_key: "k".to_string(),
            ..Default::default()
        });
        let aggregator = ResultAggregator::new(Batch::new("b"), Arc::new(ScriptedBackend::new()), &config);
        TestLifecycle::new(config, driver, aggregator)
    }

    #[tokio::test]
    async fn test_launch_failure_aborts_execution() {
        let driver = Arc::new(ScriptedDriver::new().failing_launch());
        let outcome = lifecycle(driver).run_execution(&Noop).await;

        assert!(outcome.execution.is_none());
        assert!(matches!(outcome.error, Some(HarnessError::DriverLaunch(_))));
        assert!(matches!(outcome.into_result(), Err(HarnessError::DriverLaunch(_))));
    }

    #[tokio::test]
    async fn test_clean_run_into_result() {
        let driver = Arc::new(ScriptedDriver::new());
        let outcome = lifecycle(driver).run_execution(&Noop).await;

        assert!(outcome.is_success());
        assert!(outcome.into_result().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_becomes_interaction_error() {
        let driver = Arc::new(ScriptedDriver::new());
        let outcome = lifecycle(driver.clone()).run_execution(&Panics).await;

        match &outcome.error {
            Some(HarnessError::Interaction { reason, .. }) => assert!(reason.contains("boom")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(outcome.teardown_errors.is_empty());
        assert_eq!(driver.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_summary_reports_teardown_errors() {
        let driver = Arc::new(ScriptedDriver::new().failing_close());
        let outcome = lifecycle(driver).run_execution(&Noop).await;

        assert!(outcome.error.is_none());
        let summary = outcome.summary();
        assert!(!summary.success);
        assert_eq!(summary.teardown_errors.len(), 1);
        assert!(outcome.into_result().is_err());
    }
}
