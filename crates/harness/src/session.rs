//! Browser sessions
//!
//! A session owns one launched browser and the page the scenario drives.
//! It is never shared between executions.

use std::sync::Arc;

use tracing::{debug, info};

use crate::driver::{AutomationDriver, CaptureArea, DriverHandle, SurfaceHandle};
use crate::error::{HarnessError, HarnessResult};
use crate::target::Viewport;

pub struct SessionHandle {
    driver: Arc<dyn AutomationDriver>,
    handle: DriverHandle,
    surface: SurfaceHandle,
    viewport: Viewport,
    app_name: String,
    test_name: String,
    closed: bool,
}

impl SessionHandle {
    /// Open a page on a launched browser and size it to `viewport`
    pub async fn open(
        driver: Arc<dyn AutomationDriver>,
        handle: DriverHandle,
        app_name: &str,
        test_name: &str,
        viewport: Viewport,
    ) -> HarnessResult<Self> {
        if viewport.width == 0 || viewport.height == 0 {
            return Err(HarnessError::SessionOpen(format!(
                "cannot apply viewport {}",
                viewport
            )));
        }

        let surface = driver
            .new_surface(handle)
            .await
            .map_err(|e| HarnessError::SessionOpen(format!("no page for '{}': {}", test_name, e)))?;

        driver
            .set_viewport(surface, viewport)
            .await
            .map_err(|e| HarnessError::SessionOpen(format!("cannot apply viewport {}: {}", viewport, e)))?;

        info!("Session opened for '{}' ({}, {})", test_name, app_name, viewport);

        Ok(Self {
            driver,
            handle,
            surface,
            viewport,
            app_name: app_name.to_string(),
            test_name: test_name.to_string(),
            closed: false,
        })
    }

    /// Close the browser. Only the first call is valid.
    pub async fn close(&mut self) -> HarnessResult<()> {
        if self.closed {
            return Err(HarnessError::InvalidState(format!(
                "session for '{}' is already closed",
                self.test_name
            )));
        }
        self.closed = true;

        debug!("Closing session for '{}'", self.test_name);
        self.driver.close(self.handle).await
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    fn ensure_open(&self) -> HarnessResult<()> {
        if self.closed {
            return Err(HarnessError::InvalidState(format!(
                "session for '{}' is closed",
                self.test_name
            )));
        }
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> HarnessResult<()> {
        self.ensure_open()?;
        self.driver
            .navigate(self.surface, url)
            .await
            .map_err(|e| HarnessError::interaction(format!("navigate:{}", url), e))
    }

    pub async fn fill(&self, selector: &str, value: &str) -> HarnessResult<()> {
        self.ensure_open()?;
        self.driver
            .fill_field(self.surface, selector, value)
            .await
            .map_err(|e| HarnessError::interaction(format!("fill:{}", selector), e))
    }

    pub async fn click(&self, selector: &str) -> HarnessResult<()> {
        self.ensure_open()?;
        self.driver
            .click(self.surface, selector)
            .await
            .map_err(|e| HarnessError::interaction(format!("click:{}", selector), e))
    }

    pub async fn wait_for_selector(&self, selector: &str, timeout_ms: u64) -> HarnessResult<()> {
        self.ensure_open()?;
        self.driver
            .wait_for_selector(self.surface, selector, timeout_ms)
            .await
            .map_err(|e| HarnessError::interaction(format!("wait:{}", selector), e))
    }

    /// PNG of the current page or of one region of it
    pub(crate) async fn screenshot(&self, area: CaptureArea<'_>) -> HarnessResult<Vec<u8>> {
        self.ensure_open()?;
        self.driver.screenshot(self.surface, area).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{LaunchOptions, ScriptedDriver};

    async fn open(driver: Arc<ScriptedDriver>) -> HarnessResult<SessionHandle> {
        let handle = driver.launch(&LaunchOptions::default()).await?;
        SessionHandle::open(driver, handle, "ACME Bank", "login", Viewport::new(1024, 768)).await
    }

    #[tokio::test]
    async fn test_second_close_is_invalid_state() {
        let driver = Arc::new(ScriptedDriver::new());
        let mut session = open(driver.clone()).await.unwrap();

        session.close().await.unwrap();
        assert!(!session.is_open());
        assert_eq!(driver.open_handles(), 0);

        let err = session.close().await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_open_failure_is_session_open_error() {
        let driver = Arc::new(ScriptedDriver::new().failing_surface());
        let err = open(driver).await.err().unwrap();
        assert!(matches!(err, HarnessError::SessionOpen(_)));
    }

    #[tokio::test]
    async fn test_zero_viewport_rejected() {
        let driver = Arc::new(ScriptedDriver::new());
        let handle = driver.launch(&LaunchOptions::default()).await.unwrap();
        let err = SessionHandle::open(driver, handle, "app", "t", Viewport::new(0, 768))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::SessionOpen(_)));
    }

    #[tokio::test]
    async fn test_driver_failure_is_interaction_error() {
        let driver = Arc::new(ScriptedDriver::new().missing_selector("#log-in"));
        let session = open(driver).await.unwrap();

        let err = session.click("#log-in").await.unwrap_err();
        match err {
            HarnessError::Interaction { step, .. } => assert_eq!(step, "click:#log-in"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_interaction_after_close_is_invalid_state() {
        let driver = Arc::new(ScriptedDriver::new());
        let mut session = open(driver).await.unwrap();
        session.close().await.unwrap();

        let err = session.navigate("https://demo.example").await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState(_)));
    }
}
