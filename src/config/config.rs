//! Configuration structures and loading

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Main bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Container engine configuration
    #[serde(default)]
    pub engine: EngineConfiguration,

    /// Sandbox container configuration
    #[serde(default)]
    pub container: ContainerConfiguration,

    /// Container pool configuration
    #[serde(default)]
    pub pool: PoolConfiguration,

    /// Browser session configuration
    #[serde(default)]
    pub session: SessionConfiguration,

    /// Capability server deployment configuration
    #[serde(default)]
    pub deploy: DeployConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        Ok(config)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            engine: EngineConfiguration::default(),
            container: ContainerConfiguration::default(),
            pool: PoolConfiguration::default(),
            session: SessionConfiguration::default(),
            deploy: DeployConfiguration::default(),
        }
    }
}

/// Which container engine driver to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineDriver {
    /// Talk to the engine API directly (bollard)
    Docker,
    /// Shell out to the docker binary
    Cli,
}

/// Container engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfiguration {
    /// Driver selection
    #[serde(default = "default_engine_driver")]
    pub driver: EngineDriver,

    /// Engine socket path (library driver only)
    #[serde(default)]
    pub socket: Option<String>,
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            driver: default_engine_driver(),
            socket: None,
        }
    }
}

fn default_engine_driver() -> EngineDriver {
    EngineDriver::Docker
}

/// Sandbox container configuration
///
/// Memory, CPU and timeout values are kept as the raw strings from the config
/// file; the typed accessors parse them and fall back to defaults silently.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfiguration {
    /// Image reference for the browser sandbox
    #[serde(default = "default_image")]
    pub image: String,

    /// Engine network the sandboxes attach to
    #[serde(default = "default_network")]
    pub network: String,

    /// Memory cap, e.g. "512m" or "1g"
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// CPU share as a decimal multiple of one core, e.g. "1.0"
    #[serde(default = "default_cpu_share")]
    pub cpu_share: String,

    /// PID cap for the container
    #[serde(default = "default_pid_limit")]
    pub pid_limit: i64,

    /// Size of the tmpfs mount, e.g. "64m"
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,

    /// Run the root filesystem read-only
    #[serde(default = "default_read_only_rootfs")]
    pub read_only_rootfs: bool,

    /// User the container process runs as
    #[serde(default = "default_run_as_user")]
    pub run_as_user: String,

    /// Container start timeout, e.g. "30s"
    #[serde(default = "default_start_timeout")]
    pub start_timeout: String,
}

impl Default for ContainerConfiguration {
    fn default() -> Self {
        Self {
            image: default_image(),
            network: default_network(),
            memory_limit: default_memory_limit(),
            cpu_share: default_cpu_share(),
            pid_limit: default_pid_limit(),
            tmpfs_size: default_tmpfs_size(),
            read_only_rootfs: default_read_only_rootfs(),
            run_as_user: default_run_as_user(),
            start_timeout: default_start_timeout(),
        }
    }
}

impl ContainerConfiguration {
    /// Memory cap in bytes (default 512 MiB)
    pub fn memory_limit_bytes(&self) -> u64 {
        parse_memory_string(&self.memory_limit).unwrap_or(DEFAULT_MEMORY_BYTES)
    }

    /// CPU share as a fraction of one core (default 1.0)
    pub fn cpu_share_value(&self) -> f64 {
        parse_cpu_string(&self.cpu_share).unwrap_or(DEFAULT_CPU_SHARE)
    }

    /// Start timeout (default 30 s)
    pub fn start_timeout_duration(&self) -> Duration {
        parse_duration_string(&self.start_timeout).unwrap_or(DEFAULT_START_TIMEOUT)
    }
}

fn default_image() -> String {
    "autopus/chromium-sandbox:latest".into()
}

fn default_network() -> String {
    "autopus-sandbox-net".into()
}

fn default_memory_limit() -> String {
    "512m".into()
}

fn default_cpu_share() -> String {
    "1.0".into()
}

fn default_pid_limit() -> i64 {
    100
}

fn default_tmpfs_size() -> String {
    "64m".into()
}

fn default_read_only_rootfs() -> bool {
    true
}

fn default_run_as_user() -> String {
    "chromium".into()
}

fn default_start_timeout() -> String {
    "30s".into()
}

const DEFAULT_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_CPU_SHARE: f64 = 1.0;
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Container pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfiguration {
    /// Hard bound on containers (warm + active)
    #[serde(default = "default_max_containers")]
    pub max_containers: i64,

    /// Number of pre-created warm containers to maintain
    #[serde(default = "default_warm_pool_size")]
    pub warm_pool_size: i64,

    /// Idle timeout for warm containers, e.g. "5m"
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout: String,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            max_containers: default_max_containers(),
            warm_pool_size: default_warm_pool_size(),
            idle_timeout: default_pool_idle_timeout(),
        }
    }
}

impl PoolConfiguration {
    /// Idle timeout (default 5 min)
    pub fn idle_timeout_duration(&self) -> Duration {
        parse_duration_string(&self.idle_timeout).unwrap_or(Duration::from_secs(300))
    }
}

fn default_max_containers() -> i64 {
    5
}

fn default_warm_pool_size() -> i64 {
    2
}

fn default_pool_idle_timeout() -> String {
    "5m".into()
}

/// Browser session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfiguration {
    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle timeout before a session is evicted, e.g. "30m"
    #[serde(default = "default_session_idle_timeout")]
    pub idle_timeout: String,

    /// Maximum age of a session regardless of activity, e.g. "2h"
    #[serde(default = "default_max_active_age")]
    pub max_active_age: String,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout: default_session_idle_timeout(),
            max_active_age: default_max_active_age(),
        }
    }
}

impl SessionConfiguration {
    /// Idle timeout (default 30 min)
    pub fn idle_timeout_duration(&self) -> Duration {
        parse_duration_string(&self.idle_timeout).unwrap_or(Duration::from_secs(30 * 60))
    }

    /// Maximum active age (default 2 h)
    pub fn max_active_age_duration(&self) -> Duration {
        parse_duration_string(&self.max_active_age).unwrap_or(Duration::from_secs(2 * 60 * 60))
    }
}

fn default_max_sessions() -> usize {
    2
}

fn default_session_idle_timeout() -> String {
    "30m".into()
}

fn default_max_active_age() -> String {
    "2h".into()
}

/// Capability server deployment configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfiguration {
    /// Base directory capability servers are materialized under
    #[serde(default = "default_deploy_base")]
    pub base_directory: PathBuf,
}

impl Default for DeployConfiguration {
    fn default() -> Self {
        Self {
            base_directory: default_deploy_base(),
        }
    }
}

fn default_deploy_base() -> PathBuf {
    PathBuf::from(".autopus/services")
}

/// Parse a memory size string with a required `m` or `g` suffix
/// (case-insensitive) into bytes.
pub fn parse_memory_string(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if trimmed.len() < 2 {
        return None;
    }

    let (number, suffix) = trimmed.split_at(trimmed.len() - 1);
    let amount: u64 = match number.parse() {
        Ok(n) => n,
        Err(_) => {
            debug!("Unparseable memory value {:?}, using default", value);
            return None;
        }
    };

    match suffix {
        "m" | "M" => Some(amount * 1024 * 1024),
        "g" | "G" => Some(amount * 1024 * 1024 * 1024),
        _ => {
            debug!("Unknown memory suffix {:?}, using default", value);
            None
        }
    }
}

/// Parse a CPU share string ("0.5", "2") into a fraction of one core.
///
/// The engine drivers scale the fraction by the 100 000 µs CFS period.
pub fn parse_cpu_string(value: &str) -> Option<f64> {
    match value.trim().parse::<f64>() {
        Ok(share) if share > 0.0 => Some(share),
        _ => {
            debug!("Unparseable CPU share {:?}, using default", value);
            None
        }
    }
}

/// Parse a duration literal ("500ms", "30s", "5m", "2h") into a Duration.
pub fn parse_duration_string(value: &str) -> Option<Duration> {
    let trimmed = value.trim();

    let (number, multiplier_ms) = if let Some(n) = trimmed.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = trimmed.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = trimmed.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = trimmed.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        debug!("Unknown duration suffix {:?}, using default", value);
        return None;
    };

    match number.parse::<u64>() {
        Ok(n) => Some(Duration::from_millis(n * multiplier_ms)),
        Err(_) => {
            debug!("Unparseable duration {:?}, using default", value);
            None
        }
    }
}
