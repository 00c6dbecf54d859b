//! Image acquisition: one still image per cycle, written to the capture
//! directory under a timestamp-derived name.

use facegate_hw::frame::FrameError;
use facegate_hw::{Camera, CameraError, PresenceSensor, SensorError};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

/// Interval between scans of the sensor's storage mount.
const MOUNT_SCAN_INTERVAL: Duration = Duration::from_millis(200);

/// FAT stores modification times at two-second resolution, rounded down.
const MTIME_RESOLUTION: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("sensor: {0}")]
    Sensor(#[from] SensorError),
    #[error("sensor storage {0} never became available")]
    StorageUnavailable(PathBuf),
    #[error("no new image appeared in {mount} within {waited:?}")]
    NoNewImage { mount: PathBuf, waited: Duration },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<CaptureError>,
    },
}

/// Produces a freshly written image file on demand.
///
/// The sensor is lent by the control loop for strategies that capture
/// through it; others ignore it.
pub trait ImageAcquirer {
    fn capture(&mut self, sensor: &mut dyn PresenceSensor) -> Result<PathBuf, CaptureError>;

    /// Attempts spent by the most recent [`capture`](Self::capture).
    fn last_attempts(&self) -> u32 {
        1
    }
}

impl<A: ImageAcquirer + ?Sized> ImageAcquirer for Box<A> {
    fn capture(&mut self, sensor: &mut dyn PresenceSensor) -> Result<PathBuf, CaptureError> {
        (**self).capture(sensor)
    }

    fn last_attempts(&self) -> u32 {
        (**self).last_attempts()
    }
}

/// Bounded retry with a fixed backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    /// Returns the final result and the number of attempts made.
    pub fn run<T, E: fmt::Display>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> (Result<T, E>, u32) {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if attempt >= self.max_attempts => {
                    tracing::warn!(attempt, error = %e, "{what} failed; attempts exhausted");
                    return (Err(e), attempt);
                }
                Err(e) => {
                    tracing::warn!(attempt, max = self.max_attempts, error = %e, "{what} failed; retrying");
                    std::thread::sleep(self.backoff);
                    attempt += 1;
                }
            }
        }
    }
}

/// Retries a whole inner capture under a [`RetryPolicy`].
pub struct Retrying<A> {
    inner: A,
    policy: RetryPolicy,
    last_attempts: u32,
}

impl<A: ImageAcquirer> Retrying<A> {
    pub fn new(inner: A, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            last_attempts: 0,
        }
    }
}

impl<A: ImageAcquirer> ImageAcquirer for Retrying<A> {
    fn capture(&mut self, sensor: &mut dyn PresenceSensor) -> Result<PathBuf, CaptureError> {
        let (result, attempts) = self
            .policy
            .run("capture", || self.inner.capture(&mut *sensor));
        self.last_attempts = attempts;
        result.map_err(|last| CaptureError::Exhausted {
            attempts,
            last: Box::new(last),
        })
    }

    fn last_attempts(&self) -> u32 {
        self.last_attempts
    }
}

/// Opens the camera, reads exactly one frame, writes it as PNG, releases
/// the camera. Any failure is returned immediately.
pub struct DirectCapture {
    device: String,
    capture_dir: PathBuf,
    warmup_frames: usize,
}

impl DirectCapture {
    pub fn new(device: impl Into<String>, capture_dir: impl Into<PathBuf>, warmup_frames: usize) -> Self {
        Self {
            device: device.into(),
            capture_dir: capture_dir.into(),
            warmup_frames,
        }
    }
}

impl ImageAcquirer for DirectCapture {
    fn capture(&mut self, _sensor: &mut dyn PresenceSensor) -> Result<PathBuf, CaptureError> {
        let camera = Camera::open(&self.device)?;
        let frame = camera.capture_still(self.warmup_frames)?;
        drop(camera);

        let path = unique_capture_path(&self.capture_dir, "png")?;
        frame.save(&path)?;
        tracing::debug!(path = %path.display(), seq = frame.sequence, "frame written");
        Ok(path)
    }
}

/// Settings for [`ProxiedCapture`].
#[derive(Debug, Clone)]
pub struct ProxiedSettings {
    /// Where the sensor's removable storage is mounted.
    pub mount: PathBuf,
    pub capture_dir: PathBuf,
    /// How long to wait for the new image after the save instruction.
    pub file_wait: Duration,
    pub delete_original: bool,
    /// Budget for the save instruction, which the sensor drops at times.
    pub retry: RetryPolicy,
}

/// Has the sensor save a picture to its own storage, then collects the
/// new file from the mount into the capture directory.
pub struct ProxiedCapture {
    settings: ProxiedSettings,
    last_attempts: u32,
}

impl ProxiedCapture {
    pub fn new(settings: ProxiedSettings) -> Self {
        Self {
            settings,
            last_attempts: 0,
        }
    }

    fn wait_for_new_image(&self, fresh: &Freshness) -> Result<PathBuf, CaptureError> {
        let mount = &self.settings.mount;
        let start = Instant::now();
        // A candidate is accepted once its size is non-zero and unchanged
        // across two scans, so a file still being written is not copied.
        let mut pending: Option<(PathBuf, u64)> = None;

        loop {
            if mount.is_dir() {
                if let Some((path, len)) = newest_image(mount, fresh)? {
                    match &pending {
                        Some((p, l)) if *p == path && *l == len && len > 0 => return Ok(path),
                        _ => pending = Some((path, len)),
                    }
                }
            }

            if start.elapsed() >= self.settings.file_wait {
                return Err(if mount.is_dir() {
                    CaptureError::NoNewImage {
                        mount: mount.clone(),
                        waited: self.settings.file_wait,
                    }
                } else {
                    CaptureError::StorageUnavailable(mount.clone())
                });
            }
            std::thread::sleep(MOUNT_SCAN_INTERVAL);
        }
    }
}

impl ImageAcquirer for ProxiedCapture {
    fn capture(&mut self, sensor: &mut dyn PresenceSensor) -> Result<PathBuf, CaptureError> {
        let fresh = Freshness::before_save(&self.settings.mount)?;

        let (saved, attempts) = self.settings.retry.run("save picture", || sensor.save_picture());
        self.last_attempts = attempts;
        saved.map_err(|e| CaptureError::Exhausted {
            attempts,
            last: Box::new(e.into()),
        })?;

        let original = self.wait_for_new_image(&fresh)?;
        let ext = original
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("jpg")
            .to_ascii_lowercase();
        let local = unique_capture_path(&self.settings.capture_dir, &ext)?;
        fs::copy(&original, &local).map_err(|source| CaptureError::Io {
            path: local.clone(),
            source,
        })?;

        if self.settings.delete_original {
            if let Err(e) = fs::remove_file(&original) {
                tracing::warn!(path = %original.display(), error = %e, "failed to delete sensor-side image");
            }
        }
        tracing::debug!(from = %original.display(), to = %local.display(), "sensor image collected");
        Ok(local)
    }

    fn last_attempts(&self) -> u32 {
        self.last_attempts
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png" | "bmp"))
}

fn list_images(dir: &Path) -> Result<Vec<(PathBuf, fs::Metadata)>, CaptureError> {
    let io_err = |source: io::Error| CaptureError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if !is_image(&path) {
            continue;
        }
        let meta = entry.metadata().map_err(io_err)?;
        if meta.is_file() {
            images.push((path, meta));
        }
    }
    Ok(images)
}

/// What counts as the picture produced by this save instruction: a file
/// modified no earlier than the instruction, and absent from the mount
/// before it when the mount was already present.
struct Freshness {
    not_before: SystemTime,
    known: Option<HashSet<PathBuf>>,
}

impl Freshness {
    fn before_save(mount: &Path) -> Result<Self, CaptureError> {
        let known = if mount.is_dir() {
            Some(list_images(mount)?.into_iter().map(|(p, _)| p).collect())
        } else {
            None
        };
        let now = SystemTime::now();
        Ok(Self {
            not_before: now.checked_sub(MTIME_RESOLUTION).unwrap_or(now),
            known,
        })
    }

    fn admits(&self, path: &Path, meta: &fs::Metadata) -> bool {
        if self.known.as_ref().is_some_and(|known| known.contains(path)) {
            return false;
        }
        // Files without a readable mtime cannot be proven new.
        meta.modified().is_ok_and(|t| t >= self.not_before)
    }
}

fn newest_image(mount: &Path, fresh: &Freshness) -> Result<Option<(PathBuf, u64)>, CaptureError> {
    Ok(list_images(mount)?
        .into_iter()
        .filter(|(p, meta)| fresh.admits(p, meta))
        .max_by_key(|(p, meta)| (meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), p.clone()))
        .map(|(p, meta)| (p, meta.len())))
}

/// `capture-<timestamp>.<ext>` in `dir`, suffixed if that name is taken.
pub fn unique_capture_path(dir: &Path, ext: &str) -> Result<PathBuf, CaptureError> {
    fs::create_dir_all(dir).map_err(|source| CaptureError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S%.3f");
    let mut candidate = dir.join(format!("capture-{stamp}.{ext}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("capture-{stamp}-{n}.{ext}"));
        n += 1;
    }
    Ok(candidate)
}
