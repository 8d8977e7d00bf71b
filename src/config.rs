//! Configuration loader and validator for the image and analysis workers.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub storage: Storage,
    pub processing: Processing,
    pub vision: Vision,
    pub llm: Llm,
    pub analysis: Analysis,
    pub garbage: Garbage,
}

/// Daemon and queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    /// Deliveries before a message is moved to the dead-letter table.
    pub max_attempts: u32,
    /// How long a received message stays hidden before redelivery.
    pub visibility_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storage {
    pub root: String,
}

/// Background removal and thumbnail settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Processing {
    /// Segmentation models tried in order until one passes validation.
    pub models: Vec<String>,
    pub max_dimension: u32,
    pub min_output_dimension: u32,
    pub thumbnail_max_dimension: u32,
    pub min_subject_area_ratio: f64,
    pub max_aspect_ratio_drift: f64,
    pub brightness_threshold: f64,
}

/// Segmentation service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vision {
    pub base_url: String,
    pub timeout_seconds: u64,
}

/// Messages API used for valuation and garbage detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Llm {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub version: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Analysis {
    pub model: String,
    pub max_tokens: u32,
    pub stale_after_minutes: i64,
    /// Report sections whose absence marks an analysis as truncated.
    pub required_sections: Vec<String>,
    pub max_images: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Garbage {
    pub model: String,
    pub delete_flagged: bool,
    /// Results flagging more than this share of images are not applied.
    pub max_flagged_fraction: f64,
    /// The fraction guard only applies to sets at least this large.
    #[serde(default = "default_min_examined_for_guard")]
    pub min_examined_for_guard: usize,
}

fn default_min_examined_for_guard() -> usize {
    4
}

impl Config {
    /// Ensure the data and storage directories exist.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        for dir in [&self.app.data_dir, &self.storage.root] {
            if !dir.trim().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// `DATABASE_URL` wins; otherwise a SQLite file inside `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/moxon.db", self.app.data_dir))
    }
}

impl Llm {
    /// Key from the config file, or `LLM_API_KEY` when the file leaves it empty.
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var("LLM_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }
    if cfg.app.visibility_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.visibility_timeout_seconds must be > 0"));
    }

    if cfg.storage.root.trim().is_empty() {
        return Err(ConfigError::Invalid("storage.root must be non-empty"));
    }

    let p = &cfg.processing;
    if p.models.is_empty() || p.models.iter().any(|m| m.trim().is_empty()) {
        return Err(ConfigError::Invalid("processing.models must be non-empty"));
    }
    if p.max_dimension == 0 {
        return Err(ConfigError::Invalid("processing.max_dimension must be > 0"));
    }
    if p.thumbnail_max_dimension == 0 {
        return Err(ConfigError::Invalid("processing.thumbnail_max_dimension must be > 0"));
    }
    if p.min_output_dimension > p.max_dimension {
        return Err(ConfigError::Invalid(
            "processing.min_output_dimension must not exceed processing.max_dimension",
        ));
    }
    if !(0.0..=1.0).contains(&p.min_subject_area_ratio) {
        return Err(ConfigError::Invalid("processing.min_subject_area_ratio must be within 0..=1"));
    }
    if p.max_aspect_ratio_drift <= 0.0 {
        return Err(ConfigError::Invalid("processing.max_aspect_ratio_drift must be > 0"));
    }
    if !(0.0..=255.0).contains(&p.brightness_threshold) {
        return Err(ConfigError::Invalid("processing.brightness_threshold must be within 0..=255"));
    }

    if cfg.vision.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("vision.base_url must be non-empty"));
    }
    if cfg.llm.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("llm.base_url must be non-empty"));
    }
    if cfg.llm.version.trim().is_empty() {
        return Err(ConfigError::Invalid("llm.version must be non-empty"));
    }

    if cfg.analysis.model.trim().is_empty() {
        return Err(ConfigError::Invalid("analysis.model must be non-empty"));
    }
    if cfg.analysis.max_tokens == 0 {
        return Err(ConfigError::Invalid("analysis.max_tokens must be > 0"));
    }
    if cfg.analysis.stale_after_minutes <= 0 {
        return Err(ConfigError::Invalid("analysis.stale_after_minutes must be > 0"));
    }
    if cfg.analysis.max_images == 0 {
        return Err(ConfigError::Invalid("analysis.max_images must be > 0"));
    }

    if cfg.garbage.model.trim().is_empty() {
        return Err(ConfigError::Invalid("garbage.model must be non-empty"));
    }
    if !(cfg.garbage.max_flagged_fraction > 0.0 && cfg.garbage.max_flagged_fraction <= 1.0) {
        return Err(ConfigError::Invalid("garbage.max_flagged_fraction must be within (0, 1]"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 300
  max_attempts: 5
  visibility_timeout_seconds: 900

storage:
  root: "./data/objects"

processing:
  models:
    - "birefnet-general"
    - "u2net"
  max_dimension: 2048
  min_output_dimension: 100
  thumbnail_max_dimension: 300
  min_subject_area_ratio: 0.05
  max_aspect_ratio_drift: 0.5
  brightness_threshold: 128.0

vision:
  base_url: "http://localhost:8090/"
  timeout_seconds: 120

llm:
  base_url: "https://api.anthropic.com/"
  api_key: ""
  version: "2023-06-01"
  timeout_seconds: 600

analysis:
  model: "claude-sonnet-4-5"
  max_tokens: 16000
  stale_after_minutes: 15
  required_sections:
    - "Recommendations"
  max_images: 20

garbage:
  model: "claude-haiku-4-5"
  delete_flagged: false
  max_flagged_fraction: 0.5
  min_examined_for_guard: 4
"#
}
