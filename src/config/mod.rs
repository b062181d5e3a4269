//! Configuration file handling
//!
//! Configuration is read once at start-up into an immutable [`Config`] value
//! and handed to the components that need it. The file is YAML:
//!
//! ```yaml
//! provisioner: swarm
//! state_path: /var/lib/dockyard/state.yaml
//! swarm:
//!   swarm_port: 2377
//!   tls_root_path: ~/.dockyard/certs
//!   registry: registry.example.com:5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::SWARM_PORT;

/// Default config file location: ~/.dockyard/config
pub fn default_config_path() -> PathBuf {
    dockyard_home().join("config")
}

/// Default state file location: ~/.dockyard/state.yaml
pub fn default_state_path() -> PathBuf {
    dockyard_home().join("state.yaml")
}

fn dockyard_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dockyard")
}

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of the provisioner to run
    #[serde(default = "default_provisioner")]
    pub provisioner: String,

    /// Where cluster members and image metadata are persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,

    #[serde(default)]
    pub swarm: SwarmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provisioner: default_provisioner(),
            state_path: None,
            swarm: SwarmConfig::default(),
        }
    }
}

impl Config {
    /// State file path, falling back to the default location
    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .as_ref()
            .map(|p| expand_path(p))
            .unwrap_or_else(default_state_path)
    }
}

/// Settings of the swarm provisioner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Port the swarm control plane listens on
    #[serde(default = "default_swarm_port")]
    pub swarm_port: u16,

    /// Directory holding ca.pem, cert.pem and key.pem for mutual TLS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_root_path: Option<PathBuf>,

    /// Timeout of a single control-plane request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How often task state is polled while waiting
    #[serde(default = "default_task_poll_interval_ms")]
    pub task_poll_interval_ms: u64,

    /// Longest wait for a task to reach a state
    #[serde(default = "default_task_max_wait_secs")]
    pub task_max_wait_secs: u64,

    /// Registry host images are pushed to; none keeps images local
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,

    /// Repository namespace for platform and app images
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Command inside platform images that unpacks and builds an archive
    #[serde(default = "default_deploy_cmd")]
    pub deploy_cmd: String,

    /// Container port used when an image does not declare one
    #[serde(default = "default_port")]
    pub default_port: u16,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            swarm_port: default_swarm_port(),
            tls_root_path: None,
            request_timeout_secs: default_request_timeout_secs(),
            task_poll_interval_ms: default_task_poll_interval_ms(),
            task_max_wait_secs: default_task_max_wait_secs(),
            registry: None,
            namespace: default_namespace(),
            deploy_cmd: default_deploy_cmd(),
            default_port: default_port(),
        }
    }
}

impl SwarmConfig {
    /// TLS trust root with `~` and environment variables expanded
    pub fn tls_root_path(&self) -> Option<PathBuf> {
        self.tls_root_path.as_ref().map(|p| expand_path(p))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    pub fn task_max_wait(&self) -> Duration {
        Duration::from_secs(self.task_max_wait_secs)
    }
}

fn default_provisioner() -> String {
    "swarm".to_string()
}

fn default_swarm_port() -> u16 {
    SWARM_PORT
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_task_poll_interval_ms() -> u64 {
    250
}

fn default_task_max_wait_secs() -> u64 {
    300
}

fn default_namespace() -> String {
    "dockyard".to_string()
}

fn default_deploy_cmd() -> String {
    "/var/lib/dockyard/deploy".to_string()
}

fn default_port() -> u16 {
    8888
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse config from YAML string
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject values that would make the provisioner unusable
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.swarm.swarm_port == 0 {
        return Err(ConfigError::Invalid("swarm.swarm_port must not be 0".to_string()));
    }
    if config.swarm.task_poll_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "swarm.task_poll_interval_ms must not be 0".to_string(),
        ));
    }
    if config.swarm.namespace.trim().is_empty() {
        return Err(ConfigError::Invalid("swarm.namespace must not be empty".to_string()));
    }
    Ok(())
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load config from the default location
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&default_config_path())
}

/// Load config from a specific path; a missing file yields the defaults
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}
