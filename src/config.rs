//! Deployer configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file is valid.

use crate::release::ReleaseSelector;
use serde::{Deserialize, Serialize};
use std::cmp::min;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployerConfig {
    /// sqlx connection string for the catalog and registry tables
    pub database_url: String,
    /// Root directory for downloaded asset blobs
    pub data_dir: PathBuf,
    pub release_host: ReleaseHostConfig,
    pub download: DownloadConfig,
    pub extract: ExtractConfig,
    pub deploy: DeployConfig,
    pub scheduler: SchedulerConfig,
    pub api: ApiConfig,
    /// Prometheus listener; metrics are recorded but not exported when absent
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/deployer.db?mode=rwc".to_string(),
            data_dir: PathBuf::from("./data"),
            release_host: ReleaseHostConfig::default(),
            download: DownloadConfig::default(),
            extract: ExtractConfig::default(),
            deploy: DeployConfig::default(),
            scheduler: SchedulerConfig::default(),
            api: ApiConfig::default(),
            metrics_addr: None,
        }
    }
}

impl DeployerConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: DeployerConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.download.chunk_size == 0 {
            return Err(ConfigError::Invalid("download.chunk_size must be > 0".into()));
        }
        if self.deploy.upload_chunk_size == 0 {
            return Err(ConfigError::Invalid("deploy.upload_chunk_size must be > 0".into()));
        }
        if self.deploy.upload_concurrency == 0 {
            return Err(ConfigError::Invalid("deploy.upload_concurrency must be > 0".into()));
        }
        if self.deploy.overhead_constant == 0 {
            return Err(ConfigError::Invalid("deploy.overhead_constant must be > 0".into()));
        }
        if self.extract.max_entries_per_step == 0 {
            return Err(ConfigError::Invalid("extract.max_entries_per_step must be > 0".into()));
        }
        if self.extract.max_bytes_per_step == 0 {
            return Err(ConfigError::Invalid("extract.max_bytes_per_step must be > 0".into()));
        }
        Ok(())
    }

    /// Configuration for tests and `--simulate`: in-memory database, small chunks, no pacing.
    pub fn for_testing(data_dir: &Path) -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            data_dir: data_dir.to_path_buf(),
            download: DownloadConfig {
                chunk_size: 1024,
                chunks_per_second: 0,
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay_ms: 0,
                    max_delay_ms: 0,
                },
            },
            deploy: DeployConfig {
                upload_chunk_size: 512,
                ..DeployConfig::default()
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseHostConfig {
    pub api_url: String,
    pub owner: String,
    pub repo: String,
    pub token: Option<String>,
    pub user_agent: String,
    /// Upper bound for retrying the list-releases call
    pub list_max_elapsed_ms: u64,
}

impl Default for ReleaseHostConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            owner: String::new(),
            repo: String::new(),
            token: None,
            user_agent: "vault-deployer".to_string(),
            list_max_elapsed_ms: 30_000,
        }
    }
}

/// Exponential retry budget for transport-level chunk failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        let exponential = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(min(exponential, self.max_delay_ms))
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Bytes per range request
    pub chunk_size: u64,
    /// 0 = unlimited
    pub chunks_per_second: u32,
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            chunks_per_second: 0,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub max_entries_per_step: usize,
    pub max_bytes_per_step: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_entries_per_step: 64,
            max_bytes_per_step: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Resource units charged on top of the requested initial cycles
    pub creation_overhead: u128,
    /// Resource units per unit of the conversion rate (cycles per XDR)
    pub overhead_constant: u128,
    pub upload_chunk_size: usize,
    /// Chunk pushes in flight per stage step
    pub upload_concurrency: usize,
    /// Consecutive failed push rounds before a stage fails
    pub max_push_attempts: u32,
    /// Principal the deployer acts as on the platform
    pub installer: String,
    pub revoke_installer_permission: bool,
    pub default_selector: ReleaseSelector,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            creation_overhead: 500_000_000_000,
            overhead_constant: 1_000_000_000_000,
            upload_chunk_size: 1_900_000,
            upload_concurrency: 4,
            max_push_attempts: 5,
            installer: "deployer".to_string(),
            revoke_installer_permission: true,
            default_selector: ReleaseSelector::Latest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    /// 0 disables periodic release polling
    pub refresh_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            refresh_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}
