//! YAML configuration
//!
//! Loaded from `--config <path>` or `<config dir>/narrex/config.yaml`.
//! A missing file means built-in defaults; every field is optional.

use crate::batch::FailedPolicy;
use crate::inference::http::ChatSettings;
use crate::inference::TaskKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    pub model: String,
    /// Falls back to the `NARREX_API_KEY` environment variable.
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Collaborator's safe concurrent-request ceiling across the process.
    pub admission_limit: usize,
    pub directives: HashMap<TaskKind, String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            model: "qwen2.5-14b-instruct".to_string(),
            api_key: None,
            temperature: 0.3,
            max_tokens: 4000,
            timeout_secs: 120,
            admission_limit: 6,
            directives: HashMap::new(),
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key: self
                .api_key
                .clone()
                .or_else(|| std::env::var("NARREX_API_KEY").ok()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            directives: self.directives.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub file_concurrency: usize,
    pub failed_policy: FailedPolicy,
    pub max_consecutive_checkpoint_failures: usize,
    pub input_extension: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            file_concurrency: 2,
            failed_policy: FailedPolicy::Retry,
            max_consecutive_checkpoint_failures: 3,
            input_extension: "txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub base_url: String,
    pub workflow_template: PathBuf,
    pub output_dir: PathBuf,
    pub images_per_character: u32,
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
    pub file_concurrency: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".to_string(),
            workflow_template: PathBuf::from("workflows/character_t2i.json"),
            output_dir: PathBuf::from("output/characters"),
            images_per_character: 1,
            poll_interval_ms: 1000,
            timeout_secs: 300,
            file_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Extraction ledger; defaults under the platform data dir.
    pub checkpoint_db: Option<PathBuf>,
    /// Image ledger; defaults under the platform data dir.
    pub image_checkpoint_db: Option<PathBuf>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub inference: InferenceConfig,
    pub batch: BatchConfig,
    pub image: ImageConfig,
    pub storage: StorageConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            batch: BatchConfig::default(),
            image: ImageConfig::default(),
            storage: StorageConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"))
        .join("narrex")
}

impl Config {
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Default location: `<config dir>/narrex/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("narrex").join("config.yaml"))
    }

    /// Load an explicit file, or the default file if present, or defaults.
    pub fn load(explicit: Option<&Path>) -> ConfigResult<Self> {
        match explicit {
            Some(path) => Self::from_yaml_file(path),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_yaml_file(&path),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn checkpoint_db(&self) -> PathBuf {
        self.storage
            .checkpoint_db
            .clone()
            .unwrap_or_else(|| data_dir().join("checkpoints.db"))
    }

    pub fn image_checkpoint_db(&self) -> PathBuf {
        self.storage
            .image_checkpoint_db
            .clone()
            .unwrap_or_else(|| data_dir().join("image_checkpoints.db"))
    }

    /// Reject unusable values.
    pub fn validate(&self) -> ConfigResult<()> {
        let positive = [
            ("batch.file_concurrency", self.batch.file_concurrency),
            ("inference.admission_limit", self.inference.admission_limit),
            (
                "batch.max_consecutive_checkpoint_failures",
                self.batch.max_consecutive_checkpoint_failures,
            ),
            ("image.file_concurrency", self.image.file_concurrency),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
            }
        }
        if self.inference.timeout_secs == 0 || self.image.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least 1 second".into()));
        }
        if self.image.images_per_character == 0 {
            return Err(ConfigError::Invalid(
                "image.images_per_character must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Describe an extraction setup whose peak collaborator load exceeds the gate.
///
/// Loading happens before logging is installed, so callers report this
/// themselves once the effective settings are known.
pub fn capacity_warning(file_concurrency: usize, admission_limit: usize) -> Option<String> {
    let peak = file_concurrency.saturating_mul(TaskKind::ANALYSES.len());
    (peak > admission_limit).then(|| {
        format!(
            "file_concurrency {} x {} analyses = {} exceeds admission_limit {}; extra calls will queue",
            file_concurrency,
            TaskKind::ANALYSES.len(),
            peak,
            admission_limit
        )
    })
}
