use crate::core::corner::CornerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Largest accepted corner triangle leg, in pixels.
pub const MAX_CORNER_SAMPLE: u32 = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Which phases of the pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stages {
    pub exact: bool,
    pub near: bool,
    pub corners: bool,
}

impl Default for Stages {
    fn default() -> Self {
        Self {
            exact: true,
            near: true,
            corners: true,
        }
    }
}

impl Stages {
    /// Standalone corner-artifact pass.
    pub fn corners_only() -> Self {
        Self {
            exact: false,
            near: false,
            corners: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Recognized image extensions, lowercase, without the dot.
    pub extensions: Vec<String>,
    /// Fingerprint side length; fingerprints are `hash_size²` bits.
    pub hash_size: u32,
    /// Maximum Hamming distance for two images to count as near duplicates.
    pub threshold: u32,
    /// Categories with fewer images than this are protected.
    pub min_count: usize,
    pub corners: CornerConfig,
    pub stages: Stages,
    /// Worker threads for hashing; 0 lets rayon decide.
    pub workers: usize,
    /// Reuse fingerprints stored under the root from a previous run.
    pub use_cache: bool,
    pub show_progress: bool,
    /// Directory under the root that quarantined files are moved into.
    pub quarantine_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            extensions: ["jpg", "jpeg", "png", "bmp", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            hash_size: 8,
            threshold: 5,
            min_count: 500,
            corners: CornerConfig::default(),
            stages: Stages::default(),
            workers: 0,
            use_cache: false,
            show_progress: true,
            quarantine_dir: "duplicates".to_string(),
        }
    }
}

impl EngineConfig {
    /// Default config file location, `<config dir>/leafcull/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("leafcull").join("config.json"))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load an explicit file, else the default location if it exists, else
    /// built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                log::debug!("Loading config from {}", path.display());
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(4..=32).contains(&self.hash_size) {
            return Err(ConfigError::InvalidValue {
                field: "hash_size",
                message: format!("{} is outside 4..=32", self.hash_size),
            });
        }
        let bits = self.hash_size * self.hash_size;
        if self.threshold > bits {
            return Err(ConfigError::InvalidValue {
                field: "threshold",
                message: format!("{} exceeds the {}-bit fingerprint width", self.threshold, bits),
            });
        }
        if !(0.0..=1.0).contains(&self.corners.dark_ratio) {
            return Err(ConfigError::InvalidValue {
                field: "corners.dark_ratio",
                message: format!("{} is outside 0..=1", self.corners.dark_ratio),
            });
        }
        if !(1..=MAX_CORNER_SAMPLE).contains(&self.corners.sample_size) {
            return Err(ConfigError::InvalidValue {
                field: "corners.sample_size",
                message: format!("{} is outside 1..={}", self.corners.sample_size, MAX_CORNER_SAMPLE),
            });
        }
        if self.extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "extensions",
                message: "at least one extension is required".to_string(),
            });
        }
        if self.quarantine_dir.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "quarantine_dir",
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn accepts_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }
}
