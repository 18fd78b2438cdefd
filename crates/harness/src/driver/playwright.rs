//! Playwright browser automation
//!
//! Each launched browser is a long-lived `node` process running a small
//! bridge script. Commands go in as JSON lines on stdin, replies come back
//! as JSON lines on stdout, matched by request id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, info, warn};

use super::{AutomationDriver, CaptureArea, DriverHandle, LaunchOptions, SurfaceHandle};
use crate::error::{HarnessError, HarnessResult};
use crate::target::Viewport;

const BRIDGE_SCRIPT: &str = r#"
const { chromium, firefox, webkit } = require('playwright');
const readline = require('readline');

const reply = (id, ok, extra) =>
  process.stdout.write(JSON.stringify(Object.assign({ id, ok }, extra || {})) + '\n');

(async () => {
  const engines = { chromium, firefox, webkit };
  const engine = engines[process.env.BRIDGE_BROWSER] || chromium;
  const browser = await engine.launch({ headless: process.env.BRIDGE_HEADLESS === '1' });
  const pages = new Map();
  let nextPage = 1;
  reply(0, true);

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    let cmd;
    try { cmd = JSON.parse(line); } catch (e) { continue; }
    try {
      const page = cmd.page === undefined ? undefined : pages.get(cmd.page);
      if (cmd.page !== undefined && !page) throw new Error('unknown page ' + cmd.page);
      switch (cmd.op) {
        case 'new_page': {
          const context = await browser.newContext();
          const p = await context.newPage();
          const id = nextPage++;
          pages.set(id, p);
          reply(cmd.id, true, { page: id });
          break;
        }
        case 'viewport':
          await page.setViewportSize({ width: cmd.width, height: cmd.height });
          reply(cmd.id, true);
          break;
        case 'navigate':
          await page.goto(cmd.url, { timeout: cmd.timeout_ms });
          reply(cmd.id, true);
          break;
        case 'fill':
          await page.fill(cmd.selector, cmd.value, { timeout: cmd.timeout_ms });
          reply(cmd.id, true);
          break;
        case 'click':
          await page.click(cmd.selector, { timeout: cmd.timeout_ms });
          reply(cmd.id, true);
          break;
        case 'wait':
          await page.waitForSelector(cmd.selector, { state: 'visible', timeout: cmd.timeout_ms });
          reply(cmd.id, true);
          break;
        case 'screenshot':
          if (cmd.selector) {
            await page.locator(cmd.selector).screenshot({ path: cmd.path, timeout: cmd.timeout_ms });
          } else {
            await page.screenshot({ path: cmd.path, fullPage: cmd.full_page, timeout: cmd.timeout_ms });
          }
          reply(cmd.id, true);
          break;
        case 'close':
          reply(cmd.id, true);
          await browser.close();
          process.exit(0);
        default:
          throw new Error('unknown op ' + cmd.op);
      }
    } catch (error) {
      reply(cmd.id, false, { error: error.message });
    }
  }
  await browser.close();
})().catch((error) => {
  reply(0, false, { error: error.message });
  process.exit(1);
});
"#;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    NewPage,
    Viewport { page: u64, width: u32, height: u32 },
    Navigate { page: u64, url: &'a str, timeout_ms: u64 },
    Fill { page: u64, selector: &'a str, value: &'a str, timeout_ms: u64 },
    Click { page: u64, selector: &'a str, timeout_ms: u64 },
    Wait { page: u64, selector: &'a str, timeout_ms: u64 },
    Screenshot {
        page: u64,
        path: String,
        selector: Option<&'a str>,
        full_page: bool,
        timeout_ms: u64,
    },
    Close,
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    #[serde(default)]
    id: u64,
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    page: Option<u64>,
}

/// One running bridge process
struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    // Holds bridge.js on disk for the lifetime of the process
    _workdir: tempfile::TempDir,
}

impl BridgeProcess {
    /// Send a command and wait for the reply carrying the same id
    async fn request(&mut self, command: &BridgeCommand<'_>, wait: Duration) -> HarnessResult<BridgeReply> {
        self.next_id += 1;
        let id = self.next_id;

        let mut value = serde_json::to_value(command)?;
        value["id"] = id.into();
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');

        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HarnessError::driver(format!("bridge write failed: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| HarnessError::driver(format!("bridge write failed: {}", e)))?;

        let stdout = &mut self.stdout;
        let read = async {
            loop {
                match stdout.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<BridgeReply>(&line) {
                        Ok(reply) if reply.id == id => return Ok(reply),
                        Ok(_) => continue,
                        Err(_) => debug!("[bridge] {}", line),
                    },
                    Ok(None) => return Err(HarnessError::driver("bridge process exited")),
                    Err(e) => return Err(HarnessError::driver(format!("bridge read failed: {}", e))),
                }
            }
        };

        let reply = tokio::time::timeout(wait, read)
            .await
            .map_err(|_| HarnessError::driver(format!("bridge did not answer within {:?}", wait)))??;

        if !reply.ok {
            return Err(HarnessError::driver(
                reply.error.unwrap_or_else(|| "unknown bridge error".to_string()),
            ));
        }

        Ok(reply)
    }

    /// Stop the process, escalating from a close command to SIGTERM to kill
    async fn shutdown(&mut self) {
        if let Err(e) = self.request(&BridgeCommand::Close, Duration::from_secs(5)).await {
            debug!("Bridge close command failed: {}", e);
        }

        if tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await.is_ok() {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                    && tokio::time::timeout(Duration::from_millis(500), self.child.wait()).await.is_ok()
                {
                    return;
                }
            }
        }

        warn!("Bridge process did not exit, killing it");
        let _ = self.child.kill().await;
    }
}

/// Playwright-backed automation driver
pub struct PlaywrightDriver {
    config: PlaywrightConfig,
    processes: Mutex<HashMap<u64, Arc<AsyncMutex<BridgeProcess>>>>,
    next_handle: AtomicU64,
    screenshot_counter: AtomicU64,
    /// Whether `npx playwright --version` succeeded; checked once by `launch`
    installed: OnceCell<bool>,
}

impl PlaywrightDriver {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            screenshot_counter: AtomicU64::new(0),
            installed: OnceCell::new(),
        }
    }

    /// Whether `npx playwright` can be run on this machine
    pub fn is_available() -> bool {
        Self::check_playwright_installed().is_ok()
    }

    fn check_playwright_installed() -> HarnessResult<()> {
        let output = Command::new("npx")
            .args(["playwright", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match output {
            Ok(status) if status.success() => Ok(()),
            _ => Err(HarnessError::DriverLaunch(
                "Playwright not found. Install with: npx playwright install".to_string(),
            )),
        }
    }

    /// Checked once per driver; concurrent launches share the result
    async fn ensure_installed(&self) -> HarnessResult<()> {
        let installed = *self
            .installed
            .get_or_init(|| async {
                TokioCommand::new(&self.config.npx_binary)
                    .args(["playwright", "--version"])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map(|status| status.success())
                    .unwrap_or(false)
            })
            .await;

        if installed {
            Ok(())
        } else {
            Err(HarnessError::DriverLaunch(
                "Playwright not found. Install with: npx playwright install".to_string(),
            ))
        }
    }

    fn process(&self, handle: DriverHandle) -> HarnessResult<Arc<AsyncMutex<BridgeProcess>>> {
        self.processes
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| HarnessError::driver(format!("unknown or closed driver handle {}", handle.0)))
    }

    /// Send a command to the bridge owning `handle`
    async fn send(&self, handle: DriverHandle, command: BridgeCommand<'_>, timeout_ms: u64) -> HarnessResult<BridgeReply> {
        let process = self.process(handle)?;
        let mut process = process.lock().await;
        // Playwright enforces the per-action timeout; the slack covers bridge overhead
        process
            .request(&command, Duration::from_millis(timeout_ms) + Duration::from_secs(5))
            .await
    }

    async fn spawn_bridge(&self, options: &LaunchOptions) -> HarnessResult<BridgeProcess> {
        let workdir = tempfile::tempdir()?;
        let script_path = workdir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_SCRIPT)?;

        let node_path = match &self.config.node_path {
            Some(p) => p.clone(),
            None => std::env::current_dir()?.join("node_modules"),
        };

        let mut child = TokioCommand::new(&self.config.node_binary)
            .arg(&script_path)
            .env("NODE_PATH", &node_path)
            .env("BRIDGE_BROWSER", options.browser.as_str())
            .env("BRIDGE_HEADLESS", if options.headless { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessError::DriverLaunch(format!(
                    "failed to spawn {}: {}",
                    self.config.node_binary.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HarnessError::DriverLaunch("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::DriverLaunch("bridge stdout unavailable".to_string()))?;

        Ok(BridgeProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
            _workdir: workdir,
        })
    }

    /// Wait for the bridge's ready line (id 0)
    async fn wait_for_ready(process: &mut BridgeProcess, wait: Duration) -> HarnessResult<()> {
        let stdout = &mut process.stdout;
        let read = async {
            loop {
                match stdout.next_line().await {
                    Ok(Some(line)) => {
                        if let Ok(reply) = serde_json::from_str::<BridgeReply>(&line) {
                            return Ok(reply);
                        }
                        debug!("[bridge] {}", line);
                    }
                    Ok(None) => return Err(HarnessError::DriverLaunch("bridge exited during startup".to_string())),
                    Err(e) => return Err(HarnessError::DriverLaunch(e.to_string())),
                }
            }
        };

        let reply = tokio::time::timeout(wait, read)
            .await
            .map_err(|_| HarnessError::DriverLaunch(format!("browser not ready after {:?}", wait)))??;

        if !reply.ok {
            return Err(HarnessError::DriverLaunch(
                reply.error.unwrap_or_else(|| "browser launch failed".to_string()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AutomationDriver for PlaywrightDriver {
    async fn launch(&self, options: &LaunchOptions) -> HarnessResult<DriverHandle> {
        self.ensure_installed().await?;

        let mut process = self.spawn_bridge(options).await.map_err(|e| match e {
            HarnessError::DriverLaunch(_) => e,
            other => HarnessError::DriverLaunch(other.to_string()),
        })?;

        if let Err(e) = Self::wait_for_ready(&mut process, self.config.launch_timeout).await {
            let _ = process.child.kill().await;
            return Err(e);
        }

        let handle = DriverHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.processes
            .lock()
            .insert(handle.0, Arc::new(AsyncMutex::new(process)));

        info!(
            "Launched {} (handle {}, headless: {})",
            options.browser.as_str(),
            handle.0,
            options.headless
        );
        Ok(handle)
    }

    async fn new_surface(&self, handle: DriverHandle) -> HarnessResult<SurfaceHandle> {
        let reply = self
            .send(handle, BridgeCommand::NewPage, self.config.action_timeout_ms)
            .await?;
        let id = reply
            .page
            .ok_or_else(|| HarnessError::driver("bridge returned no page id"))?;
        Ok(SurfaceHandle { driver: handle, id })
    }

    async fn set_viewport(&self, surface: SurfaceHandle, viewport: Viewport) -> HarnessResult<()> {
        let command = BridgeCommand::Viewport {
            page: surface.id,
            width: viewport.width,
            height: viewport.height,
        };
        self.send(surface.driver, command, self.config.action_timeout_ms).await?;
        Ok(())
    }

    async fn navigate(&self, surface: SurfaceHandle, url: &str) -> HarnessResult<()> {
        debug!("navigate:{}", url);
        let timeout_ms = self.config.navigation_timeout_ms;
        let command = BridgeCommand::Navigate { page: surface.id, url, timeout_ms };
        self.send(surface.driver, command, timeout_ms).await?;
        Ok(())
    }

    async fn fill_field(&self, surface: SurfaceHandle, selector: &str, text: &str) -> HarnessResult<()> {
        debug!("fill:{}", selector);
        let timeout_ms = self.config.action_timeout_ms;
        let command = BridgeCommand::Fill { page: surface.id, selector, value: text, timeout_ms };
        self.send(surface.driver, command, timeout_ms).await?;
        Ok(())
    }

    async fn click(&self, surface: SurfaceHandle, selector: &str) -> HarnessResult<()> {
        debug!("click:{}", selector);
        let timeout_ms = self.config.action_timeout_ms;
        let command = BridgeCommand::Click { page: surface.id, selector, timeout_ms };
        self.send(surface.driver, command, timeout_ms).await?;
        Ok(())
    }

    async fn wait_for_selector(&self, surface: SurfaceHandle, selector: &str, timeout_ms: u64) -> HarnessResult<()> {
        debug!("wait:{}", selector);
        let command = BridgeCommand::Wait { page: surface.id, selector, timeout_ms };
        self.send(surface.driver, command, timeout_ms).await?;
        Ok(())
    }

    async fn screenshot(&self, surface: SurfaceHandle, area: CaptureArea<'_>) -> HarnessResult<Vec<u8>> {
        std::fs::create_dir_all(&self.config.screenshot_dir)?;

        let n = self.screenshot_counter.fetch_add(1, Ordering::SeqCst);
        let path = self
            .config
            .screenshot_dir
            .join(format!("{}-{}-{}.png", surface.driver.0, surface.id, n));

        let (selector, full_page) = match area {
            CaptureArea::FullPage => (None, true),
            CaptureArea::Region(sel) => (Some(sel), false),
        };
        let timeout_ms = self.config.action_timeout_ms;
        let command = BridgeCommand::Screenshot {
            page: surface.id,
            path: path.to_string_lossy().to_string(),
            selector,
            full_page,
            timeout_ms,
        };
        self.send(surface.driver, command, timeout_ms).await?;

        let bytes = tokio::fs::read(&path).await?;
        debug!("screenshot:{} ({} bytes)", path.display(), bytes.len());
        Ok(bytes)
    }

    async fn close(&self, handle: DriverHandle) -> HarnessResult<()> {
        let process = self
            .processes
            .lock()
            .remove(&handle.0)
            .ok_or_else(|| HarnessError::driver(format!("unknown or closed driver handle {}", handle.0)))?;

        info!("Closing browser (handle {})", handle.0);
        process.lock().await.shutdown().await;
        Ok(())
    }
}

/// Configuration for the Playwright driver
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub node_binary: PathBuf,
    pub npx_binary: PathBuf,
    /// Directory containing the `playwright` package (defaults to ./node_modules)
    pub node_path: Option<PathBuf>,
    pub screenshot_dir: PathBuf,
    pub launch_timeout: Duration,
    pub navigation_timeout_ms: u64,
    pub action_timeout_ms: u64,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            node_binary: PathBuf::from("node"),
            npx_binary: PathBuf::from("npx"),
            node_path: None,
            screenshot_dir: PathBuf::from("test-results/screenshots"),
            launch_timeout: Duration::from_secs(30),
            navigation_timeout_ms: 30_000,
            action_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_command_wire_shape() {
        let command = BridgeCommand::Fill {
            page: 3,
            selector: "#username",
            value: "andy",
            timeout_ms: 5000,
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["op"], "fill");
        assert_eq!(value["page"], 3);
        assert_eq!(value["selector"], "#username");

        let value = serde_json::to_value(&BridgeCommand::NewPage).unwrap();
        assert_eq!(value["op"], "new_page");
    }

    #[test]
    fn test_parse_bridge_reply() {
        let reply: BridgeReply = serde_json::from_str(r#"{"id":4,"ok":true,"page":1}"#).unwrap();
        assert!(reply.ok);
        assert_eq!(reply.page, Some(1));

        let reply: BridgeReply =
            serde_json::from_str(r#"{"id":5,"ok":false,"error":"Timeout 5000ms exceeded"}"#).unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.error.as_deref(), Some("Timeout 5000ms exceeded"));
    }

    #[tokio::test]
    async fn test_missing_playwright_fails_launch_once_checked() {
        let driver = PlaywrightDriver::new(PlaywrightConfig {
            npx_binary: PathBuf::from("/nonexistent/npx"),
            ..Default::default()
        });

        for _ in 0..2 {
            let err = driver.launch(&LaunchOptions::default()).await.unwrap_err();
            assert!(matches!(err, HarnessError::DriverLaunch(ref m) if m.contains("Playwright not found")));
        }
        assert_eq!(driver.installed.get(), Some(&false));
    }

    #[tokio::test]
    async fn test_unknown_handle_is_driver_error() {
        let driver = PlaywrightDriver::new(PlaywrightConfig::default());
        let err = driver.close(DriverHandle(42)).await.unwrap_err();
        assert!(matches!(err, HarnessError::Driver { .. }));
    }
}
