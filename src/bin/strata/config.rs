use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use strata::storage::StoreOptions;
use thiserror::Error;

/// Settings read from the CLI config file.
#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl CliConfig {
    /// Loads `explicit`, else the default config path. A missing file yields defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        Ok(Self { path, data })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_volume(&self) -> Option<&PathBuf> {
        self.data.volume.default_path.as_ref()
    }

    /// Store options from the `[store]` table, validated.
    pub fn store_options(&self) -> Result<StoreOptions, ConfigError> {
        let options = self.data.store.clone().unwrap_or_default();
        options
            .validate()
            .map_err(|source| ConfigError::InvalidStore {
                message: source.to_string(),
            })?;
        Ok(options)
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    volume: VolumeSection,
    #[serde(default)]
    store: Option<StoreOptions>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct VolumeSection {
    #[serde(rename = "default")]
    default_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid [store] settings: {message}")]
    InvalidStore { message: String },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("strata").join("config.toml"))
}
