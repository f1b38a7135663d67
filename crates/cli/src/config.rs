//! Configuration persistence for the lora-manager CLI.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/lora-manager/config.toml, or `--config`)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Checkpoint convention (nemo, hf).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Path to the model config JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_config: Option<PathBuf>,

    /// Execution dtype override (bf16, fp16, fp32).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Element dtype of NeMo weight blobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_dtype: Option<String>,

    /// Tensor parallel size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tensor_parallel_size: Option<usize>,

    /// Tensor parallel rank of this process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tensor_parallel_rank: Option<usize>,

    /// Log level when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("lora-manager").join("config.toml"))
    }

    /// Load the default config file; a missing or unreadable file yields
    /// defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Overlay every value `other` sets.
    pub fn merge(&mut self, other: &CliConfig) {
        if other.source.is_some() {
            self.source = other.source.clone();
        }
        if other.model_config.is_some() {
            self.model_config = other.model_config.clone();
        }
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.blob_dtype.is_some() {
            self.blob_dtype = other.blob_dtype.clone();
        }
        if other.tensor_parallel_size.is_some() {
            self.tensor_parallel_size = other.tensor_parallel_size;
        }
        if other.tensor_parallel_rank.is_some() {
            self.tensor_parallel_rank = other.tensor_parallel_rank;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = CliConfig {
            source: Some("hf".to_string()),
            dtype: Some("bf16".to_string()),
            tensor_parallel_size: Some(2),
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_merge() {
        let mut base = CliConfig {
            source: Some("nemo".to_string()),
            tensor_parallel_size: Some(4),
            log_level: Some("warn".to_string()),
            ..Default::default()
        };
        let overrides = CliConfig {
            source: Some("hf".to_string()),
            tensor_parallel_rank: Some(1),
            ..Default::default()
        };

        base.merge(&overrides);

        assert_eq!(base.source.as_deref(), Some("hf"));
        assert_eq!(base.tensor_parallel_size, Some(4));
        assert_eq!(base.tensor_parallel_rank, Some(1));
        assert_eq!(base.log_level.as_deref(), Some("warn"));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "tensor_parallel_size = \"two\"").unwrap();
        assert!(matches!(
            CliConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_default_path_location() {
        if let Some(path) = CliConfig::default_path() {
            assert!(path.ends_with("lora-manager/config.toml"));
        }
    }
}
