//! In-memory automation driver for tests
//!
//! Records every call and renders a solid-colour PNG whose colour is derived
//! from the page state (url plus interactions so far), so two captures of the
//! same state are byte-identical and any interaction changes the image.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use async_trait::async_trait;
use image::{ImageOutputFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{AutomationDriver, CaptureArea, DriverHandle, LaunchOptions, SurfaceHandle};
use crate::error::{HarnessError, HarnessResult};
use crate::target::Viewport;

/// One recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverAction {
    Launch { headless: bool },
    NewSurface,
    SetViewport(Viewport),
    Navigate(String),
    Fill { selector: String, text: String },
    Click(String),
    Wait(String),
    Screenshot { region: Option<String> },
    Close,
}

#[derive(Default)]
struct PageState {
    viewport: Viewport,
    history: Vec<String>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    open: HashSet<u64>,
    pages: HashMap<(u64, u64), PageState>,
    actions: Vec<DriverAction>,
}

#[derive(Default)]
pub struct ScriptedDriver {
    state: Mutex<State>,
    fail_launch: bool,
    fail_new_surface: bool,
    panic_surface_on: Option<u64>,
    fail_close: bool,
    missing_selectors: HashSet<String>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// `launch` fails with `DriverLaunch`
    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    /// `new_surface` fails, so sessions cannot open
    pub fn failing_surface(mut self) -> Self {
        self.fail_new_surface = true;
        self
    }

    /// `new_surface` panics for the `nth` launched browser
    pub fn panicking_surface(mut self, nth: u64) -> Self {
        self.panic_surface_on = Some(nth);
        self
    }

    /// `close` fails after releasing the handle
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Interactions on this selector fail as if the element did not exist
    pub fn missing_selector(mut self, selector: &str) -> Self {
        self.missing_selectors.insert(selector.to_string());
        self
    }

    pub fn actions(&self) -> Vec<DriverAction> {
        self.state.lock().actions.clone()
    }

    /// Browsers launched and not yet closed
    pub fn open_handles(&self) -> usize {
        self.state.lock().open.len()
    }

    fn record(&self, action: DriverAction) {
        self.state.lock().actions.push(action);
    }

    fn check_selector(&self, selector: &str) -> HarnessResult<()> {
        if self.missing_selectors.contains(selector) {
            return Err(HarnessError::driver(format!(
                "waiting for selector \"{}\" failed: element not found",
                selector
            )));
        }
        Ok(())
    }

    fn with_page<T>(&self, surface: SurfaceHandle, f: impl FnOnce(&mut PageState) -> T) -> HarnessResult<T> {
        let mut state = self.state.lock();
        if !state.open.contains(&surface.driver.0) {
            return Err(HarnessError::driver(format!("browser {} is closed", surface.driver.0)));
        }
        let page = state
            .pages
            .get_mut(&(surface.driver.0, surface.id))
            .ok_or_else(|| HarnessError::driver(format!("unknown page {}", surface.id)))?;
        Ok(f(page))
    }
}

fn render_png(width: u32, height: u32, seed: &[u8]) -> HarnessResult<Vec<u8>> {
    let digest = Sha256::digest(seed);
    let img = RgbaImage::from_pixel(width, height, Rgba([digest[0], digest[1], digest[2], 255]));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)?;
    Ok(bytes)
}

#[async_trait]
impl AutomationDriver for ScriptedDriver {
    async fn launch(&self, options: &LaunchOptions) -> HarnessResult<DriverHandle> {
        if self.fail_launch {
            return Err(HarnessError::DriverLaunch("browser executable not found".to_string()));
        }
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.open.insert(handle);
        state.actions.push(DriverAction::Launch { headless: options.headless });
        Ok(DriverHandle(handle))
    }

    async fn new_surface(&self, handle: DriverHandle) -> HarnessResult<SurfaceHandle> {
        self.record(DriverAction::NewSurface);
        if self.panic_surface_on == Some(handle.0) {
            panic!("renderer crashed in browser {}", handle.0);
        }
        if self.fail_new_surface {
            return Err(HarnessError::driver("target page crashed"));
        }
        let mut state = self.state.lock();
        if !state.open.contains(&handle.0) {
            return Err(HarnessError::driver(format!("browser {} is closed", handle.0)));
        }
        let id = state.pages.keys().filter(|(d, _)| *d == handle.0).count() as u64 + 1;
        state.pages.insert((handle.0, id), PageState::default());
        Ok(SurfaceHandle { driver: handle, id })
    }

    async fn set_viewport(&self, surface: SurfaceHandle, viewport: Viewport) -> HarnessResult<()> {
        self.record(DriverAction::SetViewport(viewport));
        self.with_page(surface, |p| p.viewport = viewport)
    }

    async fn navigate(&self, surface: SurfaceHandle, url: &str) -> HarnessResult<()> {
        self.record(DriverAction::Navigate(url.to_string()));
        self.with_page(surface, |p| {
            p.history.clear();
            p.history.push(format!("goto {}", url));
        })
    }

    async fn fill_field(&self, surface: SurfaceHandle, selector: &str, text: &str) -> HarnessResult<()> {
        self.record(DriverAction::Fill {
            selector: selector.to_string(),
            text: text.to_string(),
        });
        self.check_selector(selector)?;
        self.with_page(surface, |p| p.history.push(format!("fill {}={}", selector, text)))
    }

    async fn click(&self, surface: SurfaceHandle, selector: &str) -> HarnessResult<()> {
        self.record(DriverAction::Click(selector.to_string()));
        self.check_selector(selector)?;
        self.with_page(surface, |p| p.history.push(format!("click {}", selector)))
    }

    async fn wait_for_selector(&self, surface: SurfaceHandle, selector: &str, _timeout_ms: u64) -> HarnessResult<()> {
        self.record(DriverAction::Wait(selector.to_string()));
        self.check_selector(selector)?;
        self.with_page(surface, |_| ())
    }

    async fn screenshot(&self, surface: SurfaceHandle, area: CaptureArea<'_>) -> HarnessResult<Vec<u8>> {
        let region = match area {
            CaptureArea::FullPage => None,
            CaptureArea::Region(sel) => Some(sel.to_string()),
        };
        self.record(DriverAction::Screenshot { region: region.clone() });
        if let Some(sel) = &region {
            self.check_selector(sel)?;
        }

        let (viewport, seed) = self.with_page(surface, |p| (p.viewport, p.history.join("\n")))?;
        match region {
            None => render_png(viewport.width, viewport.height, seed.as_bytes()),
            Some(sel) => render_png(64, 32, format!("{}#{}", seed, sel).as_bytes()),
        }
    }

    async fn close(&self, handle: DriverHandle) -> HarnessResult<()> {
        let mut state = self.state.lock();
        state.actions.push(DriverAction::Close);
        if !state.open.remove(&handle.0) {
            return Err(HarnessError::driver(format!("browser {} is not open", handle.0)));
        }
        state.pages.retain(|(d, _), _| *d != handle.0);
        if self.fail_close {
            return Err(HarnessError::driver("browser process exited with code 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_state_renders_same_png() {
        let driver = ScriptedDriver::new();
        let handle = driver.launch(&LaunchOptions::default()).await.unwrap();
        let page = driver.new_surface(handle).await.unwrap();
        driver.set_viewport(page, Viewport::new(40, 30)).await.unwrap();
        driver.navigate(page, "https://demo.example").await.unwrap();

        let a = driver.screenshot(page, CaptureArea::FullPage).await.unwrap();
        let b = driver.screenshot(page, CaptureArea::FullPage).await.unwrap();
        assert_eq!(a, b);

        driver.click(page, "#log-in").await.unwrap();
        let c = driver.screenshot(page, CaptureArea::FullPage).await.unwrap();
        assert_ne!(a, c);

        let img = image::load_from_memory(&c).unwrap();
        assert_eq!((img.width(), img.height()), (40, 30));
    }

    #[tokio::test]
    async fn test_missing_selector_fails() {
        let driver = ScriptedDriver::new().missing_selector("#nope");
        let handle = driver.launch(&LaunchOptions::default()).await.unwrap();
        let page = driver.new_surface(handle).await.unwrap();
        let err = driver.click(page, "#nope").await.unwrap_err();
        assert!(matches!(err, HarnessError::Driver { .. }));
    }

    #[tokio::test]
    async fn test_close_releases_handle() {
        let driver = ScriptedDriver::new();
        let handle = driver.launch(&LaunchOptions::default()).await.unwrap();
        assert_eq!(driver.open_handles(), 1);
        driver.close(handle).await.unwrap();
        assert_eq!(driver.open_handles(), 0);
        assert!(driver.close(handle).await.is_err());
    }
}
