//! Container engine trait definitions

use std::time::Duration;

use async_trait::async_trait;

/// Remote-debugging port exposed inside every sandbox container. The engine
/// maps it to a randomly assigned host port recovered from inspect.
pub const DEBUG_PORT: u16 = 9222;

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Engine unreachable: {0}")]
    Unreachable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid inspect format: {0}")]
    InvalidFormat(String),

    #[error("Image pull failed: {0}")]
    ImagePull(String),

    #[error("Engine command failed: {0}")]
    CommandFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Status tag reported by container inspect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    Other,
}

impl From<&str> for ContainerStatus {
    fn from(value: &str) -> Self {
        match value {
            "running" => ContainerStatus::Running,
            "exited" => ContainerStatus::Exited,
            _ => ContainerStatus::Other,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Other => write!(f, "other"),
        }
    }
}

/// Result of a container inspect: identity, status and the host port mapped
/// to [`DEBUG_PORT`].
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub status: ContainerStatus,
    pub host_port: Option<u16>,
}

/// Creation parameters for a sandbox container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,

    /// Image reference
    pub image: String,

    /// Network to attach to
    pub network: String,

    /// Memory cap in bytes
    pub memory_bytes: u64,

    /// CPU share as a fraction of one core
    pub cpu_share: f64,

    /// PID cap
    pub pid_limit: i64,

    /// tmpfs size string, e.g. "64m"
    pub tmpfs_size: String,

    /// Mount the root filesystem read-only
    pub read_only_rootfs: bool,

    /// User to run as
    pub user: String,
}

/// Trait abstracting the container engine
///
/// All engine mutation in the bridge funnels through implementations of this
/// trait so the pool and manager stay agnostic of the underlying driver.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Verify the engine is reachable
    async fn ping(&self) -> EngineResult<()>;

    /// Inspect a network; `NotFound` if it does not exist
    async fn network_inspect(&self, name: &str) -> EngineResult<()>;

    /// Create a network
    async fn network_create(&self, name: &str) -> EngineResult<()>;

    /// Inspect an image; `NotFound` if it is not present locally
    async fn image_inspect(&self, image: &str) -> EngineResult<()>;

    /// Pull an image, draining the pull stream to completion
    async fn image_pull(&self, image: &str) -> EngineResult<()>;

    /// Create a container, returning its id
    async fn container_create(&self, spec: &ContainerSpec) -> EngineResult<String>;

    /// Start a created container
    async fn container_start(&self, id: &str) -> EngineResult<()>;

    /// Stop a container, waiting up to `timeout` before the engine kills it
    async fn container_stop(&self, id: &str, timeout: Duration) -> EngineResult<()>;

    /// Remove a container
    async fn container_remove(&self, id: &str, force: bool) -> EngineResult<()>;

    /// Inspect a container
    async fn container_inspect(&self, id: &str) -> EngineResult<ContainerDetails>;

    /// Release any driver resources
    async fn close(&self) -> EngineResult<()>;
}
