use crate::enrollment::DEFAULT_MIN_SAMPLES;
use crate::matcher::Metric;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const DETECTOR_MODEL_FILE: &str = "res10_300x300_ssd.onnx";
const EMBEDDER_MODEL_FILE: &str = "facenet.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Which D-Bus bus the daemon owns its name on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(BusKind::System),
            "session" => Ok(BusKind::Session),
            other => Err(format!("unknown bus '{other}' (expected system or session)")),
        }
    }
}

/// Runtime configuration shared by the daemon and the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Bulk-import root and archive for service registrations.
    pub dataset_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Minimum score for a positive match (strictly greater wins).
    pub match_threshold: f32,
    pub metric: Metric,
    /// Minimum usable samples per registration.
    pub min_samples: usize,
    /// SSD confidence below which detections are dropped.
    pub detection_confidence: f32,
    /// Number of extraction worker threads in the daemon.
    pub workers: usize,
    /// Pending extraction requests before callers wait.
    pub queue_depth: usize,
    /// Sample images kept per service registration (0 disables the archive).
    pub archive_samples: usize,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db_path: data_dir.join("attendance.db"),
            dataset_dir: data_dir.join("dataset"),
            model_dir: data_dir.join("models"),
            match_threshold: 0.6,
            metric: Metric::Cosine,
            min_samples: DEFAULT_MIN_SAMPLES,
            detection_confidence: 0.5,
            workers: 2,
            queue_depth: 16,
            archive_samples: 5,
            bus: BusKind::System,
        }
    }
}

/// Optional overrides read from the TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    dataset_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    metric: Option<Metric>,
    min_samples: Option<usize>,
    detection_confidence: Option<f32>,
    workers: Option<usize>,
    queue_depth: Option<usize>,
    archive_samples: Option<usize>,
    bus: Option<BusKind>,
}

impl Config {
    /// Defaults, then the TOML file (if any), then `ROLLCALL_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = config_file_path() {
            if path.exists() {
                config.apply_file(&path)?;
                tracing::info!(path = %path.display(), "loaded config file");
            }
        }
        config.apply_env();
        Ok(config.sanitized())
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Self::parse_file(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge(file);
        Ok(())
    }

    fn parse_file(text: &str) -> Result<FileConfig, toml::de::Error> {
        toml::from_str(text)
    }

    fn merge(&mut self, file: FileConfig) {
        let FileConfig {
            db_path,
            dataset_dir,
            model_dir,
            match_threshold,
            metric,
            min_samples,
            detection_confidence,
            workers,
            queue_depth,
            archive_samples,
            bus,
        } = file;
        self.db_path = db_path.unwrap_or(self.db_path.clone());
        self.dataset_dir = dataset_dir.unwrap_or(self.dataset_dir.clone());
        self.model_dir = model_dir.unwrap_or(self.model_dir.clone());
        self.match_threshold = match_threshold.unwrap_or(self.match_threshold);
        self.metric = metric.unwrap_or(self.metric);
        self.min_samples = min_samples.unwrap_or(self.min_samples);
        self.detection_confidence = detection_confidence.unwrap_or(self.detection_confidence);
        self.workers = workers.unwrap_or(self.workers);
        self.queue_depth = queue_depth.unwrap_or(self.queue_depth);
        self.archive_samples = archive_samples.unwrap_or(self.archive_samples);
        self.bus = bus.unwrap_or(self.bus);
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_DATASET_DIR") {
            self.dataset_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        self.match_threshold = env_parse("ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.metric = env_parse("ROLLCALL_METRIC", self.metric);
        self.min_samples = env_parse("ROLLCALL_MIN_SAMPLES", self.min_samples);
        self.detection_confidence = env_parse("ROLLCALL_DETECTION_CONFIDENCE", self.detection_confidence);
        self.workers = env_parse("ROLLCALL_WORKERS", self.workers);
        self.queue_depth = env_parse("ROLLCALL_QUEUE_DEPTH", self.queue_depth);
        self.archive_samples = env_parse("ROLLCALL_ARCHIVE_SAMPLES", self.archive_samples);
        self.bus = env_parse("ROLLCALL_BUS", self.bus);
    }

    /// Clamp values into their usable ranges.
    fn sanitized(mut self) -> Self {
        if !(-1.0..=1.0).contains(&self.match_threshold) && self.metric == Metric::Cosine {
            tracing::warn!(threshold = self.match_threshold, "cosine threshold outside [-1, 1]; clamping");
            self.match_threshold = self.match_threshold.clamp(-1.0, 1.0);
        }
        self.min_samples = self.min_samples.max(1);
        self.workers = self.workers.max(1);
        self.queue_depth = self.queue_depth.max(1);
        self
    }

    /// Path to the SSD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the FaceNet embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join(EMBEDDER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .ok()?;
    Some(base.join("rollcall/config.toml"))
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value = raw, "ignoring unparseable setting");
            default
        }
    }
}
