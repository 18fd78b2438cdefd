//! Browser automation drivers
//!
//! The harness only needs a narrow slice of browser automation: launch a
//! browser, open a page, drive a few form interactions and take screenshots.
//! `PlaywrightDriver` does this through a Node bridge process;
//! `ScriptedDriver` is an in-memory stand-in for tests.

pub mod playwright;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HarnessResult;
use crate::target::Viewport;

pub use playwright::{PlaywrightConfig, PlaywrightDriver};
pub use scripted::ScriptedDriver;

/// Browser engine used for the local run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "firefox" => Browser::Firefox,
            "webkit" | "safari" => Browser::Webkit,
            _ => Browser::Chromium,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub headless: bool,
    pub browser: Browser,
}

/// A launched browser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverHandle(pub u64);

/// A page inside a launched browser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle {
    pub driver: DriverHandle,
    pub id: u64,
}

/// What a screenshot should cover
#[derive(Debug, Clone, Copy)]
pub enum CaptureArea<'a> {
    FullPage,
    Region(&'a str),
}

#[async_trait]
pub trait AutomationDriver: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> HarnessResult<DriverHandle>;

    async fn new_surface(&self, handle: DriverHandle) -> HarnessResult<SurfaceHandle>;

    async fn set_viewport(&self, surface: SurfaceHandle, viewport: Viewport) -> HarnessResult<()>;

    async fn navigate(&self, surface: SurfaceHandle, url: &str) -> HarnessResult<()>;

    async fn fill_field(&self, surface: SurfaceHandle, selector: &str, text: &str) -> HarnessResult<()>;

    async fn click(&self, surface: SurfaceHandle, selector: &str) -> HarnessResult<()>;

    async fn wait_for_selector(
        &self,
        surface: SurfaceHandle,
        selector: &str,
        timeout_ms: u64,
    ) -> HarnessResult<()>;

    /// PNG bytes of the requested area
    async fn screenshot(&self, surface: SurfaceHandle, area: CaptureArea<'_>) -> HarnessResult<Vec<u8>>;

    async fn close(&self, handle: DriverHandle) -> HarnessResult<()>;
}
