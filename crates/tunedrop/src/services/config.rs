use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where artifacts live on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("downloads"),
            extension: "mp3".to_string(),
        }
    }
}

/// Eviction policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Maximum artifact age before eviction
    pub ttl_secs: u64,
    /// How often the sweeper wakes up to check for expired artifacts
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl RetentionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// How the external extractor is invoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub program: String,
    /// Arguments placed before the generated ones, e.g. `--cookies <file>`
    #[serde(default)]
    pub extra_args: Vec<String>,
    pub audio_format: String,
    pub audio_quality: String,
    /// How long a request waits for an extraction before giving up
    pub timeout_secs: u64,
    /// How long an extraction may run before it is abandoned entirely
    pub hard_limit_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            extra_args: Vec::new(),
            audio_format: "mp3".to_string(),
            audio_quality: "192K".to_string(),
            timeout_secs: 300,
            hard_limit_secs: 1800,
        }
    }
}

impl ExtractionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn hard_limit(&self) -> Duration {
        Duration::from_secs(self.hard_limit_secs.max(self.timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
            static_dir: None,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Loads configuration from defaults, an optional TOML file and the environment
pub struct ConfigService {
    config_path: PathBuf,
}

impl ConfigService {
    pub const ENV_PREFIX: &'static str = "TUNEDROP_";

    /// Create a config service reading from `config_path` if it exists
    pub fn new(config_path: &Path) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
        }
    }

    /// Load configuration from file, with env var overrides (TUNEDROP_ prefix, __ separator)
    pub fn load(&self) -> Result<ServiceConfig> {
        let mut figment = Figment::from(Serialized::defaults(ServiceConfig::default()));

        if self.config_path.exists() {
            figment = figment.merge(Toml::file(&self.config_path));
        }

        figment = figment.merge(Env::prefixed(Self::ENV_PREFIX).split("__"));

        let config: ServiceConfig = figment.extract().context("Failed to load configuration")?;
        Ok(config)
    }

    /// Check if the configuration file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
