use crate::acquirer::RetryPolicy;
use crate::error::GateError;
use facegate_hw::{SensorTransport, ServoConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_POLL_INTERVAL_MS: u64 = 60_000;
const MAX_DWELL_SECS: u64 = 600;
const MAX_WAIT_MS: u64 = 60_000;
const MAX_WARMUP_FRAMES: usize = 120;

/// Daemon configuration: optional TOML file named by `FACEGATE_CONFIG`,
/// then `FACEGATE_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the enrolled gallery artifact.
    pub gallery_path: PathBuf,
    /// Maximum Euclidean distance for a gallery entry to count as a match.
    pub threshold: f32,
    /// Idle sensor poll cadence.
    pub poll_interval_ms: u64,
    /// How long the lock stays open after a positive match.
    pub dwell_secs: u64,
    /// Directory receiving one captured image per cycle.
    pub capture_dir: PathBuf,
    pub capture: CaptureConfig,
    pub sensor: SensorTransport,
    pub provider: ProviderConfig,
    pub actuator: ServoConfig,
}

/// Image acquisition strategy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum CaptureConfig {
    /// Read one frame from a directly attached V4L2 camera. A failed
    /// capture is not retried unless `attempts` is raised above 1.
    Direct {
        #[serde(default = "default_camera_device")]
        device: String,
        /// Frames discarded after stream start while exposure settles.
        #[serde(default = "default_warmup_frames")]
        warmup_frames: usize,
        #[serde(default = "default_direct_attempts")]
        attempts: u32,
        #[serde(default = "default_backoff_ms")]
        backoff_ms: u64,
    },
    /// Have the sensor save a picture to its card and collect it from the mount.
    Proxied {
        mount: PathBuf,
        #[serde(default = "default_file_wait_ms")]
        file_wait_ms: u64,
        #[serde(default)]
        delete_original: bool,
        #[serde(default = "default_attempts")]
        attempts: u32,
        #[serde(default = "default_backoff_ms")]
        backoff_ms: u64,
    },
}

/// External embedding helper invocation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Reject helper output whose embeddings differ from this length.
    /// Defaults to the gallery's dimensionality.
    pub embedding_dim: Option<usize>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: "facegate-embed".to_string(),
            args: Vec::new(),
            embedding_dim: None,
        }
    }
}

impl ProviderConfig {
    /// Embedding length the helper must produce at runtime: the configured
    /// one if set, else the gallery's. A configured length that disagrees
    /// with the gallery can never match and is rejected.
    pub fn resolve_embedding_dim(&self, gallery_dim: Option<usize>) -> Result<Option<usize>, GateError> {
        match (self.embedding_dim, gallery_dim) {
            (Some(configured), Some(enrolled)) if configured != enrolled => Err(GateError::Config(format!(
                "provider.embedding_dim is {configured} but the gallery holds {enrolled}-dim embeddings"
            ))),
            (configured, enrolled) => Ok(configured.or(enrolled)),
        }
    }
}

fn default_camera_device() -> String {
    "/dev/video0".to_string()
}

fn default_warmup_frames() -> usize {
    4
}

fn default_file_wait_ms() -> u64 {
    5000
}

fn default_direct_attempts() -> u32 {
    1
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            gallery_path: data_dir.join("gallery.json"),
            threshold: 0.6,
            poll_interval_ms: 500,
            dwell_secs: 5,
            capture_dir: data_dir.join("captures"),
            capture: CaptureConfig::Direct {
                device: default_camera_device(),
                warmup_frames: default_warmup_frames(),
                attempts: default_direct_attempts(),
                backoff_ms: default_backoff_ms(),
            },
            sensor: SensorTransport::default(),
            provider: ProviderConfig::default(),
            actuator: ServoConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FACEGATE_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, GateError> {
        let mut config = match std::env::var_os("FACEGATE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, GateError> {
        let text = std::fs::read_to_string(path).map_err(|source| GateError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| GateError::Config(format!("{}: {e}", path.display())))
    }

    /// Apply scalar overrides looked up by `FACEGATE_*` key.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEGATE_GALLERY") {
            self.gallery_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_CAPTURE_DIR") {
            self.capture_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_EMBED_COMMAND") {
            self.provider.command = v;
        }
        self.threshold = parse_var(&lookup, "FACEGATE_THRESHOLD").unwrap_or(self.threshold);
        self.poll_interval_ms =
            parse_var(&lookup, "FACEGATE_POLL_INTERVAL_MS").unwrap_or(self.poll_interval_ms);
        self.dwell_secs = parse_var(&lookup, "FACEGATE_DWELL_SECS").unwrap_or(self.dwell_secs);
        if let CaptureConfig::Direct {
            device,
            warmup_frames,
            ..
        } = &mut self.capture
        {
            if let Some(v) = lookup("FACEGATE_CAMERA_DEVICE") {
                *device = v;
            }
            *warmup_frames = parse_var(&lookup, "FACEGATE_WARMUP_FRAMES").unwrap_or(*warmup_frames);
        }
    }

    pub fn validate(&self) -> Result<(), GateError> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(GateError::Config(format!(
                "threshold must be a positive distance, got {}",
                self.threshold
            )));
        }
        if !(1..=MAX_POLL_INTERVAL_MS).contains(&self.poll_interval_ms) {
            return Err(GateError::Config(format!(
                "poll_interval_ms must be between 1 and {MAX_POLL_INTERVAL_MS}, got {}",
                self.poll_interval_ms
            )));
        }
        if self.dwell_secs > MAX_DWELL_SECS {
            return Err(GateError::Config(format!(
                "dwell_secs must be at most {MAX_DWELL_SECS}, got {}",
                self.dwell_secs
            )));
        }
        if self.actuator.frequency_hz == 0 {
            return Err(GateError::Config("actuator.frequency_hz must be non-zero".into()));
        }
        if let CaptureConfig::Direct { attempts: 0, .. } | CaptureConfig::Proxied { attempts: 0, .. } =
            self.capture
        {
            return Err(GateError::Config("capture.attempts must be at least 1".into()));
        }
        let (CaptureConfig::Direct { backoff_ms, .. } | CaptureConfig::Proxied { backoff_ms, .. }) =
            &self.capture;
        if *backoff_ms > MAX_WAIT_MS {
            return Err(GateError::Config(format!(
                "capture.backoff_ms must be at most {MAX_WAIT_MS}, got {backoff_ms}"
            )));
        }
        if let CaptureConfig::Direct { warmup_frames, .. } = &self.capture {
            if *warmup_frames > MAX_WARMUP_FRAMES {
                return Err(GateError::Config(format!(
                    "capture.warmup_frames must be at most {MAX_WARMUP_FRAMES}, got {warmup_frames}"
                )));
            }
        }
        if let CaptureConfig::Proxied { file_wait_ms, .. } = &self.capture {
            if *file_wait_ms > MAX_WAIT_MS {
                return Err(GateError::Config(format!(
                    "capture.file_wait_ms must be at most {MAX_WAIT_MS}, got {file_wait_ms}"
                )));
            }
        }
        if self.provider.command.is_empty() {
            return Err(GateError::Config("provider.command is empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_secs(self.dwell_secs)
    }
}

impl CaptureConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let (CaptureConfig::Direct {
            attempts,
            backoff_ms,
            ..
        }
        | CaptureConfig::Proxied {
            attempts,
            backoff_ms,
            ..
        }) = self;
        RetryPolicy::new(*attempts, Duration::from_millis(*backoff_ms))
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable override");
            None
        }
    }
}
