use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use uicheck_harness::backend::ScriptedBackend;
use uicheck_harness::batch::ExecutionInfo;
use uicheck_harness::driver::scripted::DriverAction;
use uicheck_harness::driver::{AutomationDriver, LaunchOptions, ScriptedDriver};
use uicheck_harness::recorder::CheckpointRecorder;
use uicheck_harness::session::SessionHandle;
use uicheck_harness::{
    Batch, BatchState, BrowserType, DeviceName, ExecutionContext, HarnessError, HarnessResult, MatchStrategy,
    Orientation, RenderTarget, ResultAggregator, Scenario, ScenarioSpec, SuiteConfig, SuiteRunner, TargetDescriptor,
    TargetSet, Verdict, Viewport,
};

fn scenarios_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios")
}

fn login() -> ScenarioSpec {
    ScenarioSpec::from_file(&scenarios_dir().join("login.yaml")).unwrap()
}

fn config(targets: TargetSet) -> SuiteConfig {
    SuiteConfig {
        api_key: "test-key".to_string(),
        app_name: "ACME Bank".to_string(),
        concurrency: 2,
        targets,
        ..Default::default()
    }
}

fn runner(config: SuiteConfig, driver: &Arc<ScriptedDriver>, backend: &Arc<ScriptedBackend>) -> SuiteRunner {
    SuiteRunner::new(config, driver.clone(), backend.clone()).unwrap()
}

fn two_targets() -> TargetSet {
    [
        TargetDescriptor::browser(1200, 800, BrowserType::Chrome).unwrap(),
        TargetDescriptor::device(DeviceName::Pixel2, Orientation::Landscape).unwrap(),
    ]
    .into_iter()
    .collect()
}

#[tokio::test]
async fn login_flow_runs_locally() {
    let driver = Arc::new(ScriptedDriver::new());
    let backend = Arc::new(ScriptedBackend::new());
    let report = runner(config(TargetSet::new()), &driver, &backend)
        .run_specs(vec![login()])
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.total, 2);
    assert_eq!(report.passed, 2);
    assert!(report.results.iter().all(|r| r.target == RenderTarget::Local));
    assert_eq!(report.results[0].checkpoint_name, "Login Window");
    assert_eq!(report.results[1].checkpoint_name, "App Window");
    assert!(backend.submissions().is_empty());

    let actions = driver.actions();
    assert!(actions.contains(&DriverAction::Navigate("https://demo.applitools.com".to_string())));
    assert!(actions.contains(&DriverAction::Click("#log-in".to_string())));
    assert_eq!(actions.last(), Some(&DriverAction::Close));
    assert_eq!(driver.open_handles(), 0);
}

#[tokio::test]
async fn login_flow_against_two_targets() {
    let driver = Arc::new(ScriptedDriver::new());
    let backend = Arc::new(ScriptedBackend::new());
    let report = runner(config(two_targets()), &driver, &backend)
        .run_specs(vec![login()])
        .await
        .unwrap();

    assert_eq!(report.total, 4);
    assert_eq!(report.passed, 4);

    let submissions = backend.submissions();
    assert_eq!(submissions.len(), 4);
    let app_window: Vec<_> = submissions
        .iter()
        .filter(|s| s.checkpoint_name == "App Window")
        .collect();
    assert_eq!(app_window.len(), 2);
    assert!(app_window.iter().all(|s| s.strategy == MatchStrategy::Layout));
    assert!(submissions.iter().all(|s| s.test_name == "login"));

    // Login Window and App Window show different page states
    let login_digest = &submissions.iter().find(|s| s.checkpoint_name == "Login Window").unwrap().digest;
    assert_ne!(login_digest, &app_window[0].digest);
}

#[tokio::test]
async fn visual_differences_are_reported_not_raised() {
    let driver = Arc::new(ScriptedDriver::new());
    let backend = Arc::new(ScriptedBackend::new().with_target_verdict("App Window", "chrome", Verdict::Failed));
    let r = runner(config(two_targets()), &driver, &backend);

    let report = r.run_specs(vec![login()]).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.passed, 3);
    assert!(!report.is_success());
    assert!(report.executions.iter().all(|e| e.success));

    let failed = report.results.iter().find(|r| r.verdict == Verdict::Failed).unwrap();
    assert_eq!(failed.checkpoint_name, "App Window");
    assert!(failed.diff_summary.is_some());
}

#[tokio::test]
async fn interaction_failure_still_tears_down() {
    let driver = Arc::new(ScriptedDriver::new().missing_selector("#password"));
    let backend = Arc::new(ScriptedBackend::new());
    let report = runner(config(two_targets()), &driver, &backend)
        .run_specs(vec![login()])
        .await
        .unwrap();

    let exec = &report.executions[0];
    assert!(!exec.success);
    assert!(exec.error.as_deref().unwrap().contains("fill:#password"));
    assert!(exec.teardown_errors.is_empty());

    // The checkpoint taken before the failure is still verified
    assert_eq!(report.total, 2);
    assert!(report.results.iter().all(|r| r.checkpoint_name == "Login Window"));
    assert_eq!(driver.open_handles(), 0);
    assert_eq!(backend.open_runs(), 0);
}

#[tokio::test]
async fn session_open_failure_closes_driver() {
    let driver = Arc::new(ScriptedDriver::new().failing_surface());
    let backend = Arc::new(ScriptedBackend::new());
    let report = runner(config(TargetSet::new()), &driver, &backend)
        .run_specs(vec![login()])
        .await
        .unwrap();

    let exec = &report.executions[0];
    assert!(exec.execution.is_some());
    assert!(exec.error.as_deref().unwrap().starts_with("Session failed to open"));
    assert_eq!(report.total, 0);
    assert_eq!(driver.open_handles(), 0);
}

#[tokio::test]
async fn driver_panic_is_contained_to_its_execution() {
    let driver = Arc::new(ScriptedDriver::new().panicking_surface(2));
    let backend = Arc::new(ScriptedBackend::new());
    let mut again = login();
    again.name = "login again".to_string();

    let report = runner(config(TargetSet::new()), &driver, &backend)
        .run_specs(vec![login(), again])
        .await
        .unwrap();

    assert_eq!(report.executions.len(), 2);
    let crashed: Vec<_> = report.executions.iter().filter(|e| !e.success).collect();
    assert_eq!(crashed.len(), 1);
    assert!(crashed[0].execution.is_some());
    assert!(crashed[0].error.as_deref().unwrap().contains("renderer crashed"));
    assert!(crashed[0].teardown_errors.is_empty());

    // The healthy execution keeps its results
    assert_eq!(report.total, 2);
    assert_eq!(report.passed, 2);
    assert_eq!(driver.open_handles(), 0);
}

#[tokio::test]
async fn launch_failure_aborts_only_that_execution() {
    let driver = Arc::new(ScriptedDriver::new().failing_launch());
    let backend = Arc::new(ScriptedBackend::new());
    let report = runner(config(TargetSet::new()), &driver, &backend)
        .run_specs(vec![login()])
        .await
        .unwrap();

    assert_eq!(report.executions.len(), 1);
    assert!(report.executions[0].execution.is_none());
    assert!(!report.is_success());
}

#[tokio::test]
async fn unresolved_results_time_out() {
    let driver = Arc::new(ScriptedDriver::new());
    let backend = Arc::new(ScriptedBackend::new().holding());
    let cfg = SuiteConfig {
        result_timeout: Some(Duration::from_millis(100)),
        ..config(two_targets())
    };

    let err = runner(cfg, &driver, &backend)
        .run_specs(vec![login()])
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ResultTimeout { pending: 4, .. }));
}

#[tokio::test]
async fn second_session_close_leaves_aggregator_untouched() {
    let driver = Arc::new(ScriptedDriver::new());
    let backend = Arc::new(ScriptedBackend::new());
    let cfg = config(two_targets());
    let agg = ResultAggregator::new(Batch::new("ACME Bank suite"), backend.clone(), &cfg);

    let exec = agg
        .open_execution(ExecutionInfo {
            test_name: "login".to_string(),
            app_name: cfg.app_name.clone(),
            viewport: cfg.viewport,
        })
        .unwrap();
    let handle = driver.launch(&LaunchOptions::default()).await.unwrap();
    let mut session = SessionHandle::open(driver.clone(), handle, &cfg.app_name, "login", Viewport::new(1024, 768))
        .await
        .unwrap();
    let mut recorder = CheckpointRecorder::new(agg.clone(), exec, cfg.targets.clone());
    session.navigate("https://demo.applitools.com").await.unwrap();
    recorder
        .capture(&session, "Login Window", MatchStrategy::Exact, None)
        .await
        .unwrap();

    session.close().await.unwrap();
    let phase = agg.phase();
    let results = agg.results();
    let dispatched = agg.dispatched_jobs();

    let err = session.close().await.unwrap_err();
    assert!(matches!(err, HarnessError::InvalidState(_)));
    assert_eq!(agg.phase(), phase);
    assert_eq!(agg.results(), results);
    assert_eq!(agg.dispatched_jobs(), dispatched);
    assert!(backend.submissions().is_empty());

    agg.close_execution(exec).await.unwrap();
    let results = agg.await_all_results(None).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(agg.phase(), BatchState::Closed);
}

struct HeaderOnly;

#[async_trait]
impl Scenario for HeaderOnly {
    fn name(&self) -> &str {
        "header"
    }

    async fn run(&self, ctx: &mut ExecutionContext<'_>) -> HarnessResult<()> {
        ctx.navigate("https://demo.applitools.com").await?;
        ctx.check_region("Header", "#header", MatchStrategy::Region).await?;
        // Second capture under the same name must be refused
        match ctx.check("Header", MatchStrategy::Exact).await {
            Err(HarnessError::DuplicateCheckpoint { .. }) => Ok(()),
            other => panic!("expected duplicate checkpoint, got {:?}", other.map(|c| c.name().to_string())),
        }
    }
}

#[tokio::test]
async fn code_scenarios_run_concurrently_with_yaml_ones() {
    let driver = Arc::new(ScriptedDriver::new());
    let backend = Arc::new(ScriptedBackend::new());
    let scenarios: Vec<Arc<dyn Scenario>> = vec![Arc::new(login()), Arc::new(HeaderOnly)];

    let report = runner(config(two_targets()), &driver, &backend)
        .run(scenarios)
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.executions.len(), 2);
    assert_eq!(report.total, 6);

    let header = backend
        .submissions()
        .into_iter()
        .filter(|s| s.checkpoint_name == "Header")
        .count();
    assert_eq!(header, 2);
    assert!(driver
        .actions()
        .contains(&DriverAction::Screenshot { region: Some("#header".to_string()) }));
}

#[tokio::test]
async fn run_tagged_and_write_results() {
    let output = tempfile::tempdir().unwrap();
    let driver = Arc::new(ScriptedDriver::new());
    let backend = Arc::new(ScriptedBackend::new());
    let cfg = SuiteConfig {
        output_dir: output.path().to_path_buf(),
        ..config(TargetSet::new())
    };
    let r = runner(cfg, &driver, &backend);

    let report = r.run_tagged(&scenarios_dir(), "smoke").await.unwrap();
    assert_eq!(report.executions.len(), 1);

    let none = r.run_tagged(&scenarios_dir(), "no-such-tag").await.unwrap();
    assert_eq!(none.total, 0);

    let path = r.write_results(&report).unwrap();
    assert!(path.ends_with("test-results.json"));
    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["total"], 2);
    assert_eq!(json["executions"][0]["test_name"], "login");
}

#[tokio::test]
async fn run_named_unknown_scenario_fails() {
    let driver = Arc::new(ScriptedDriver::new());
    let backend = Arc::new(ScriptedBackend::new());
    let err = runner(config(TargetSet::new()), &driver, &backend)
        .run_named(&scenarios_dir(), "checkout")
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Validation(_)));
}

#[test]
fn runner_requires_api_key() {
    let driver = Arc::new(ScriptedDriver::new());
    let backend = Arc::new(ScriptedBackend::new());
    let result = SuiteRunner::new(SuiteConfig::default(), driver, backend);
    assert!(matches!(result, Err(HarnessError::Config(_))));
}
