//! Settings file, read-only. Writing it belongs to the settings UI.

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::STANDALONE_PORT;
use crate::seeds::SEEDS_DIR_NAME;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const CONFIG_ENV: &str = "BIOME_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine the user config directory")]
    NoConfigDir,
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Never asked. Treated as a remote server.
    #[default]
    Unchosen,
    Standalone,
    Server,
}

impl EngineMode {
    pub fn is_standalone(self) -> bool {
        self == EngineMode::Standalone
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuServerConfig {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
}

impl Default for GpuServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: STANDALONE_PORT,
            use_ssl: false,
        }
    }
}

impl GpuServerConfig {
    /// `host:port` as typed into the endpoint field.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeysConfig {
    pub openai: String,
    pub fal: String,
    pub huggingface: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub prompt_sanitizer: bool,
    pub seed_generation: bool,
    pub engine_mode: EngineMode,
    pub seed_gallery: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            prompt_sanitizer: true,
            seed_generation: true,
            engine_mode: EngineMode::Unchosen,
            seed_gallery: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub mouse_sensitivity: f64,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            mouse_sensitivity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gpu_server: GpuServerConfig,
    pub api_keys: ApiKeysConfig,
    pub features: FeaturesConfig,
    pub controls: ControlsConfig,
    /// Directory holding `server.py` and its `.venv`.
    pub engine_dir: Option<PathBuf>,
    pub seeds_dir: Option<PathBuf>,
}

impl AppConfig {
    /// `$BIOME_CONFIG`, else `<config dir>/biome/config.json`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        let base = BaseDirs::new().ok_or(ConfigError::NoConfigDir)?;
        Ok(base.config_dir().join("biome").join(CONFIG_FILE_NAME))
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(target: "biome::config", path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses settings JSON, migrating `features.use_standalone_engine`.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let mut value: Value = serde_json::from_str(raw)?;
        if let Some(features) = value.get_mut("features").and_then(Value::as_object_mut) {
            if let Some(legacy) = features.remove("use_standalone_engine") {
                let mode = if legacy.as_bool().unwrap_or(true) {
                    "standalone"
                } else {
                    "server"
                };
                info!(target: "biome::config", mode, "migrating use_standalone_engine");
                features
                    .entry("engine_mode")
                    .or_insert_with(|| Value::from(mode));
            }
        }
        serde_json::from_value(value)
    }

    /// Engine directory from the file, else `<data dir>/biome/engine`.
    pub fn resolved_engine_dir(&self) -> Option<PathBuf> {
        self.engine_dir.clone().or_else(|| {
            BaseDirs::new().map(|base| base.data_dir().join("biome").join("engine"))
        })
    }

    /// Seeds directory from the file, else `<data dir>/biome/seeds`.
    pub fn resolved_seeds_dir(&self) -> Option<PathBuf> {
        self.seeds_dir.clone().or_else(|| {
            BaseDirs::new().map(|base| base.data_dir().join("biome").join(SEEDS_DIR_NAME))
        })
    }

    /// Token passed to a locally started engine, if configured.
    pub fn huggingface_token(&self) -> Option<String> {
        let token = self.api_keys.huggingface.trim();
        (!token.is_empty()).then(|| token.to_string())
    }
}
