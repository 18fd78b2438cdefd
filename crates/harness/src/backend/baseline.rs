//! Baseline screenshot comparison on the local filesystem
//!
//! Each (test, checkpoint, target) triple owns one baseline PNG. The first
//! snapshot submitted for a triple becomes its baseline; later snapshots are
//! compared pixel by pixel with a tolerance picked by the match strategy.
//! Comparisons run on the blocking pool, so jobs resolve asynchronously.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{GenericImageView, Pixel, RgbaImage};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info, warn};

use super::jobs::JobBoard;
use super::{JobId, JobOutcome, JobStatus, RunConfig, RunHandle, VisualBackend};
use crate::checkpoint::{MatchStrategy, Snapshot};
use crate::error::{HarnessError, HarnessResult};
use crate::result::Verdict;

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

/// Turn a test or checkpoint name into a file name component
fn file_key(name: &str) -> String {
    UNSAFE_CHARS
        .replace_all(name.trim(), "-")
        .trim_matches('-')
        .to_lowercase()
}

/// (per-channel tolerance, allowed share of differing pixels in percent)
fn tolerance(strategy: MatchStrategy) -> (i32, f64) {
    match strategy {
        MatchStrategy::Exact => (0, 0.0),
        // Anti-aliasing at region edges
        MatchStrategy::Region => (5, 0.5),
        MatchStrategy::Layout => (48, 5.0),
    }
}

struct RunInfo {
    batch_id: String,
    key_prefix: String,
    closed: bool,
}

/// Compares snapshots against baselines stored on disk
pub struct BaselineBackend {
    config: BaselineConfig,
    runs: Mutex<HashMap<String, RunInfo>>,
    jobs: Arc<JobBoard>,
}

impl BaselineBackend {
    pub fn new(config: BaselineConfig) -> HarnessResult<Self> {
        std::fs::create_dir_all(&config.baseline_dir)?;
        std::fs::create_dir_all(&config.diff_dir)?;

        Ok(Self {
            config,
            runs: Mutex::new(HashMap::new()),
            jobs: Arc::new(JobBoard::default()),
        })
    }

    /// Names of all stored baselines
    pub fn list_baselines(&self) -> HarnessResult<Vec<String>> {
        let mut baselines = Vec::new();

        for entry in std::fs::read_dir(&self.config.baseline_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "png").unwrap_or(false) {
                if let Some(name) = path.file_stem() {
                    baselines.push(name.to_string_lossy().to_string());
                }
            }
        }

        baselines.sort();
        Ok(baselines)
    }

    /// Remove diff images left over from earlier runs
    pub fn clean_diffs(&self) -> HarnessResult<()> {
        for entry in std::fs::read_dir(&self.config.diff_dir)? {
            std::fs::remove_file(entry?.path())?;
        }
        Ok(())
    }
}

#[async_trait]
impl VisualBackend for BaselineBackend {
    async fn open_run(&self, config: &RunConfig) -> HarnessResult<RunHandle> {
        let handle = RunHandle(uuid::Uuid::new_v4().to_string());
        let key_prefix = format!(
            "{}__{}",
            file_key(&config.test_name),
            config.target.slug()
        );

        debug!("Opened run {} for '{}' on {}", handle.0, config.test_name, config.target);
        self.runs.lock().insert(
            handle.0.clone(),
            RunInfo {
                batch_id: config.batch_id.clone(),
                key_prefix,
                closed: false,
            },
        );
        Ok(handle)
    }

    async fn submit_checkpoint(
        &self,
        run: &RunHandle,
        name: &str,
        snapshot: &Snapshot,
        strategy: MatchStrategy,
    ) -> HarnessResult<JobId> {
        let (batch_id, key) = {
            let runs = self.runs.lock();
            let info = runs
                .get(&run.0)
                .ok_or_else(|| HarnessError::Backend(format!("unknown run {}", run.0)))?;
            if info.closed {
                return Err(HarnessError::Backend(format!("run {} is closed", run.0)));
            }
            (info.batch_id.clone(), format!("{}__{}", info.key_prefix, file_key(name)))
        };

        let job = JobId(uuid::Uuid::new_v4().to_string());
        self.jobs.register(&batch_id, job.clone());

        let baseline_path = self.config.baseline_dir.join(format!("{}.png", key));
        let diff_path = self.config.diff_dir.join(format!("{}-diff.png", key));
        let update = self.config.update_baselines;
        let snapshot = snapshot.clone();
        let jobs = self.jobs.clone();
        let job_id = job.clone();

        tokio::task::spawn_blocking(move || {
            let status = match compare(&snapshot, &baseline_path, &diff_path, strategy, update) {
                Ok(status) => status,
                Err(e) => JobStatus {
                    verdict: Verdict::Failed,
                    diff: Some(format!("comparison error: {}", e)),
                },
            };
            jobs.resolve(&job_id, status);
        });

        Ok(job)
    }

    async fn close_run(&self, run: &RunHandle) -> HarnessResult<()> {
        let mut runs = self.runs.lock();
        let info = runs
            .get_mut(&run.0)
            .ok_or_else(|| HarnessError::Backend(format!("unknown run {}", run.0)))?;
        info.closed = true;
        Ok(())
    }

    async fn poll_job(&self, job: &JobId) -> HarnessResult<JobStatus> {
        self.jobs
            .status(job)
            .ok_or_else(|| HarnessError::Backend(format!("unknown job {}", job)))
    }

    async fn await_batch(&self, batch_id: &str, timeout: Option<Duration>) -> HarnessResult<Vec<JobOutcome>> {
        Ok(self.jobs.wait_for_batch(batch_id, timeout).await)
    }

    fn concurrency_cap(&self) -> Option<usize> {
        self.config.concurrency_cap
    }
}

/// Compare one snapshot against its baseline, creating the baseline if needed
fn compare(
    snapshot: &Snapshot,
    baseline_path: &Path,
    diff_path: &Path,
    strategy: MatchStrategy,
    update: bool,
) -> HarnessResult<JobStatus> {
    if !baseline_path.exists() || update {
        let existed = baseline_path.exists();
        std::fs::write(baseline_path, snapshot.bytes())?;
        info!("{} baseline {}", if existed { "Updated" } else { "Created" }, baseline_path.display());
        return Ok(JobStatus {
            verdict: Verdict::Passed,
            diff: Some(if existed { "baseline updated" } else { "new baseline" }.to_string()),
        });
    }

    let baseline_bytes = std::fs::read(baseline_path)?;
    let baseline_snapshot = Snapshot::from_png(baseline_bytes);

    // Quick hash comparison
    if baseline_snapshot.digest() == snapshot.digest() {
        debug!("Snapshot matches {} exactly (same hash)", baseline_path.display());
        return Ok(JobStatus {
            verdict: Verdict::Passed,
            diff: None,
        });
    }

    let actual_img = snapshot.decode()?;
    let baseline_img = baseline_snapshot.decode()?;

    if actual_img.dimensions() != baseline_img.dimensions() {
        warn!(
            "Snapshot dimensions differ: actual {:?} vs baseline {:?}",
            actual_img.dimensions(),
            baseline_img.dimensions()
        );
        if strategy == MatchStrategy::Layout {
            let (aw, ah) = actual_img.dimensions();
            let (bw, bh) = baseline_img.dimensions();
            return Ok(JobStatus {
                verdict: Verdict::Failed,
                diff: Some(format!("layout size changed: {}x{} vs baseline {}x{}", aw, ah, bw, bh)),
            });
        }
    }

    let (channel_tolerance, threshold) = tolerance(strategy);

    let (width, height) = actual_img.dimensions();
    let (bw, bh) = baseline_img.dimensions();
    let actual_rgba = actual_img.to_rgba8();
    let baseline_rgba = baseline_img.to_rgba8();

    let mut diff_img = RgbaImage::new(width, height);
    // Pixels outside the overlapping area count as different
    let total_pixels = (width.max(bw) as u64) * (height.max(bh) as u64);
    let overlap = (width.min(bw) as u64) * (height.min(bh) as u64);
    let mut diff_pixels = total_pixels - overlap;

    for y in 0..height {
        for x in 0..width {
            let actual_pixel = actual_rgba.get_pixel(x, y);
            if x >= bw || y >= bh {
                diff_img.put_pixel(x, y, image::Rgba([255, 0, 0, 255]));
                continue;
            }
            let baseline_pixel = baseline_rgba.get_pixel(x, y);

            if pixels_differ(actual_pixel, baseline_pixel, channel_tolerance) {
                diff_pixels += 1;
                diff_img.put_pixel(x, y, image::Rgba([255, 0, 0, 255]));
            } else {
                let c = actual_pixel.channels();
                diff_img.put_pixel(x, y, image::Rgba([c[0] / 2, c[1] / 2, c[2] / 2, 128]));
            }
        }
    }

    let diff_percent = if total_pixels == 0 {
        0.0
    } else {
        (diff_pixels as f64 / total_pixels as f64) * 100.0
    };

    if diff_pixels == 0 {
        return Ok(JobStatus {
            verdict: Verdict::Passed,
            diff: None,
        });
    }

    diff_img.save(diff_path)?;

    let matches = diff_percent <= threshold;
    if !matches {
        warn!(
            "Visual difference in {}: {:.2}% pixels differ (threshold: {:.2}%)",
            baseline_path.display(),
            diff_percent,
            threshold
        );
    }

    Ok(JobStatus {
        verdict: if matches { Verdict::Passed } else { Verdict::Failed },
        diff: Some(format!(
            "{:.2}% pixels differ ({} of {}), diff image: {}",
            diff_percent,
            diff_pixels,
            total_pixels,
            diff_path.display()
        )),
    })
}

fn pixels_differ(a: &image::Rgba<u8>, b: &image::Rgba<u8>, tolerance: i32) -> bool {
    a.channels()
        .iter()
        .zip(b.channels())
        .any(|(x, y)| (*x as i32 - *y as i32).abs() > tolerance)
}

/// Configuration for the baseline backend
#[derive(Debug, Clone)]
pub struct BaselineConfig {
    pub baseline_dir: PathBuf,
    pub diff_dir: PathBuf,
    /// Overwrite baselines with the current snapshots
    pub update_baselines: bool,
    /// Simulated account limit on parallel runs
    pub concurrency_cap: Option<usize>,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            baseline_dir: PathBuf::from("test-results/baselines"),
            diff_dir: PathBuf::from("test-results/diffs"),
            update_baselines: false,
            concurrency_cap: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{BrowserType, TargetDescriptor, Viewport};
    use std::io::Cursor;

    fn png(width: u32, height: u32, fill: [u8; 4], marks: &[(u32, u32)]) -> Snapshot {
        let mut img = RgbaImage::from_pixel(width, height, image::Rgba(fill));
        for (x, y) in marks {
            img.put_pixel(*x, *y, image::Rgba([0, 0, 0, 255]));
        }
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();
        Snapshot::from_png(bytes)
    }

    fn backend(dir: &Path) -> BaselineBackend {
        BaselineBackend::new(BaselineConfig {
            baseline_dir: dir.join("baselines"),
            diff_dir: dir.join("diffs"),
            ..Default::default()
        })
        .unwrap()
    }

    fn run_config() -> RunConfig {
        RunConfig {
            api_key: "key".to_string(),
            app_name: "ACME Bank".to_string(),
            test_name: "should log in".to_string(),
            viewport: Viewport::default(),
            batch_id: "batch-1".to_string(),
            target: TargetDescriptor::browser(800, 600, BrowserType::Chrome).unwrap(),
        }
    }

    async fn check(backend: &BaselineBackend, snapshot: &Snapshot, strategy: MatchStrategy) -> JobStatus {
        let run = backend.open_run(&run_config()).await.unwrap();
        let job = backend
            .submit_checkpoint(&run, "Login Window", snapshot, strategy)
            .await
            .unwrap();
        backend.close_run(&run).await.unwrap();
        let outcomes = backend.await_batch("batch-1", None).await.unwrap();
        assert!(outcomes.iter().all(|o| o.status.is_resolved()));
        backend.poll_job(&job).await.unwrap()
    }

    #[test]
    fn test_file_key() {
        assert_eq!(file_key("Login Window"), "login-window");
        assert_eq!(file_key("ACME BANK should log into a bank account"), "acme-bank-should-log-into-a-bank-account");
        assert_eq!(file_key("a/b\\c"), "a-b-c");
    }

    #[tokio::test]
    async fn test_first_snapshot_becomes_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let status = check(&backend, &png(20, 10, [200, 200, 200, 255], &[]), MatchStrategy::Exact).await;
        assert_eq!(status.verdict, Verdict::Passed);
        assert_eq!(status.diff.as_deref(), Some("new baseline"));
        assert_eq!(backend.list_baselines().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exact_detects_single_pixel() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        check(&backend, &png(20, 10, [200, 200, 200, 255], &[]), MatchStrategy::Exact).await;
        let status = check(&backend, &png(20, 10, [200, 200, 200, 255], &[(3, 3)]), MatchStrategy::Exact).await;

        assert_eq!(status.verdict, Verdict::Failed);
        assert!(status.diff.unwrap().contains("0.50% pixels differ"));
        assert_eq!(std::fs::read_dir(dir.path().join("diffs")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_layout_tolerates_small_changes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        check(&backend, &png(20, 10, [200, 200, 200, 255], &[]), MatchStrategy::Layout).await;
        // Slight colour shift everywhere plus one changed pixel
        let status = check(&backend, &png(20, 10, [210, 190, 200, 255], &[(1, 1)]), MatchStrategy::Layout).await;
        assert_eq!(status.verdict, Verdict::Passed);

        let status = check(&backend, &png(30, 10, [200, 200, 200, 255], &[]), MatchStrategy::Layout).await;
        assert_eq!(status.verdict, Verdict::Failed);
        assert!(status.diff.unwrap().starts_with("layout size changed"));
    }

    #[tokio::test]
    async fn test_update_overwrites_baseline() {
        let dir = tempfile::tempdir().unwrap();
        check(&backend(dir.path()), &png(8, 8, [0, 0, 255, 255], &[]), MatchStrategy::Exact).await;

        let updating = BaselineBackend::new(BaselineConfig {
            baseline_dir: dir.path().join("baselines"),
            diff_dir: dir.path().join("diffs"),
            update_baselines: true,
            concurrency_cap: None,
        })
        .unwrap();
        let status = check(&updating, &png(8, 8, [255, 0, 0, 255], &[]), MatchStrategy::Exact).await;
        assert_eq!(status.diff.as_deref(), Some("baseline updated"));

        let status = check(&backend(dir.path()), &png(8, 8, [255, 0, 0, 255], &[]), MatchStrategy::Exact).await;
        assert_eq!(status.verdict, Verdict::Passed);
        assert!(status.diff.is_none());
    }

    #[tokio::test]
    async fn test_submit_to_closed_run_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let run = backend.open_run(&run_config()).await.unwrap();
        backend.close_run(&run).await.unwrap();

        let err = backend
            .submit_checkpoint(&run, "late", &png(2, 2, [0, 0, 0, 255], &[]), MatchStrategy::Exact)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Backend(_)));
    }
}
