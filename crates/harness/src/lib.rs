//! uicheck: browser-driven UI checkpoint harness
//!
//! This crate drives a real browser through UI flows, captures named visual
//! checkpoints along the way and has them verified against baselines,
//! locally or on a set of remote render targets:
//! - Runs each scenario as an isolated execution with its own browser session
//! - Collects checkpoints into one batch shared by the whole suite
//! - Fans checkpoints out to a comparison backend with bounded concurrency
//! - Reports per-(checkpoint, target) verdicts and writes a JSON report
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  SuiteRunner                                                │
//! │    ├── Batch + ResultAggregator (shared, Arc)               │
//! │    └── per scenario: tokio task -> TestLifecycle            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestLifecycle                                              │
//! │    ├── AutomationDriver::launch                             │
//! │    ├── SessionHandle::open                                  │
//! │    ├── Scenario::run(ExecutionContext)                      │
//! │    │     └── CheckpointRecorder::capture -> submit          │
//! │    └── teardown: close_execution, close, poll_results       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ResultAggregator                                           │
//! │    ├── close_execution -> VisualBackend runs (semaphore)    │
//! │    ├── poll_results(fail_on_diff)                           │
//! │    └── await_all_results(timeout) -> [TestResult]           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Collaborators                                              │
//! │    ├── PlaywrightDriver / ScriptedDriver                    │
//! │    └── BaselineBackend / ScriptedBackend                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregator;
pub mod backend;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod recorder;
pub mod result;
pub mod scenario;
pub mod session;
pub mod suite;
pub mod target;

pub use aggregator::ResultAggregator;
pub use batch::{Batch, BatchState, ExecutionId};
pub use checkpoint::{Checkpoint, MatchStrategy};
pub use config::SuiteConfig;
pub use error::{HarnessError, HarnessResult};
pub use lifecycle::{ExecutionContext, ExecutionOutcome, Scenario, TestLifecycle};
pub use result::{SuiteReport, TestResult, Verdict};
pub use scenario::{ScenarioSpec, ScenarioStep};
pub use suite::SuiteRunner;
pub use target::{BrowserType, DeviceName, Orientation, RenderTarget, TargetDescriptor, TargetSet, Viewport};
