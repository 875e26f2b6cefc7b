//! Single-container lifecycle management

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ContainerConfiguration;
use crate::engine::{ContainerEngine, ContainerSpec, ContainerStatus, EngineError};

/// Timeout for the engine ping at construction
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period for container stop before the engine kills it
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the CDP health probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for container operations
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Engine unreachable: {0}")]
    EngineUnreachable(String),

    #[error("Container create failed: {0}")]
    CreateFailed(String),

    #[error("Container start failed: {0}")]
    StartFailed(String),

    #[error("Container remove failed: {0}")]
    RemoveFailed(String),

    #[error("Container inspect failed: {0}")]
    InspectFailed(String),

    #[error("Container unhealthy: {0}")]
    Unhealthy(String),

    #[error("Container id must not be empty")]
    EmptyId,
}

pub type ContainerResult<T> = Result<T, ContainerError>;

/// Descriptor for a sandbox container tracked by the pool
#[derive(Debug, Clone)]
pub struct ContainerDescriptor {
    /// Engine-assigned container id
    pub id: String,

    /// Host port mapped to the container's debug port
    pub host_port: u16,

    /// Status tag from the last inspect
    pub status: ContainerStatus,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Manager for single sandbox containers
///
/// Create and remove are serialized per manager so concurrent callers do not
/// interleave engine calls.
pub struct ContainerManager {
    engine: Arc<dyn ContainerEngine>,
    config: ContainerConfiguration,
    probe: reqwest::Client,
    op_lock: Mutex<()>,
}

impl ContainerManager {
    /// Create a new manager, verifying the engine is reachable.
    pub async fn new(
        engine: Arc<dyn ContainerEngine>,
        config: ContainerConfiguration,
    ) -> ContainerResult<Self> {
        tokio::time::timeout(PING_TIMEOUT, engine.ping())
            .await
            .map_err(|_| ContainerError::EngineUnreachable("ping timed out".to_string()))?
            .map_err(|e| ContainerError::EngineUnreachable(e.to_string()))?;

        let probe = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| ContainerError::EngineUnreachable(e.to_string()))?;

        Ok(Self {
            engine,
            config,
            probe,
            op_lock: Mutex::new(()),
        })
    }

    /// Ensure the sandbox network exists, creating it if absent.
    pub async fn ensure_network(&self) -> ContainerResult<()> {
        match self.engine.network_inspect(&self.config.network).await {
            Ok(()) => Ok(()),
            Err(EngineError::NotFound(_)) => {
                info!("Network {} missing, creating", self.config.network);
                self.engine
                    .network_create(&self.config.network)
                    .await
                    .map_err(|e| ContainerError::CreateFailed(e.to_string()))
            }
            Err(e) => Err(ContainerError::InspectFailed(e.to_string())),
        }
    }

    /// Ensure the sandbox image is present locally, pulling if absent.
    pub async fn ensure_image(&self) -> ContainerResult<()> {
        match self.engine.image_inspect(&self.config.image).await {
            Ok(()) => Ok(()),
            Err(EngineError::NotFound(_)) => {
                info!("Image {} missing, pulling", self.config.image);
                self.engine
                    .image_pull(&self.config.image)
                    .await
                    .map_err(|e| ContainerError::CreateFailed(e.to_string()))
            }
            Err(e) => Err(ContainerError::InspectFailed(e.to_string())),
        }
    }

    /// Create and start a sandbox container, resolving its mapped host port.
    ///
    /// Compensating teardown: a container that fails to start is
    /// force-removed; one that fails inspect is stopped and force-removed.
    pub async fn create(&self) -> ContainerResult<ContainerDescriptor> {
        let _guard = self.op_lock.lock().await;

        let name = format!("autopus-sandbox-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let spec = ContainerSpec {
            name,
            image: self.config.image.clone(),
            network: self.config.network.clone(),
            memory_bytes: self.config.memory_limit_bytes(),
            cpu_share: self.config.cpu_share_value(),
            pid_limit: self.config.pid_limit,
            tmpfs_size: self.config.tmpfs_size.clone(),
            read_only_rootfs: self.config.read_only_rootfs,
            user: self.config.run_as_user.clone(),
        };

        let id = self
            .engine
            .container_create(&spec)
            .await
            .map_err(|e| ContainerError::CreateFailed(e.to_string()))?;

        let start = tokio::time::timeout(
            self.config.start_timeout_duration(),
            self.engine.container_start(&id),
        )
        .await
        .unwrap_or_else(|_| Err(EngineError::Other("start timed out".to_string())));

        if let Err(e) = start {
            warn!("Container {} failed to start, removing: {}", id, e);
            if let Err(remove_err) = self.engine.container_remove(&id, true).await {
                warn!("Failed to remove container {}: {}", id, remove_err);
            }
            return Err(ContainerError::StartFailed(e.to_string()));
        }

        let details = match self.engine.container_inspect(&id).await {
            Ok(details) => details,
            Err(e) => {
                warn!("Container {} failed inspect, tearing down: {}", id, e);
                if let Err(stop_err) = self.engine.container_stop(&id, STOP_TIMEOUT).await {
                    warn!("Failed to stop container {}: {}", id, stop_err);
                }
                if let Err(remove_err) = self.engine.container_remove(&id, true).await {
                    warn!("Failed to remove container {}: {}", id, remove_err);
                }
                return Err(ContainerError::InspectFailed(e.to_string()));
            }
        };

        let host_port = match details.host_port {
            Some(port) => port,
            None => {
                warn!("Container {} has no mapped debug port, tearing down", id);
                if let Err(stop_err) = self.engine.container_stop(&id, STOP_TIMEOUT).await {
                    warn!("Failed to stop container {}: {}", id, stop_err);
                }
                if let Err(remove_err) = self.engine.container_remove(&id, true).await {
                    warn!("Failed to remove container {}: {}", id, remove_err);
                }
                return Err(ContainerError::InspectFailed(
                    "no host port mapped to debug port".to_string(),
                ));
            }
        };

        info!("Created sandbox container {} (port {})", id, host_port);

        Ok(ContainerDescriptor {
            id: details.id,
            host_port,
            status: details.status,
            created_at: Utc::now(),
        })
    }

    /// Stop and remove a container.
    ///
    /// Stop errors are logged and ignored; remove runs with force either way.
    pub async fn remove(&self, id: &str) -> ContainerResult<()> {
        if id.is_empty() {
            return Err(ContainerError::EmptyId);
        }

        let _guard = self.op_lock.lock().await;

        if let Err(e) = self.engine.container_stop(id, STOP_TIMEOUT).await {
            warn!("Failed to stop container {}, removing anyway: {}", id, e);
        }

        self.engine
            .container_remove(id, true)
            .await
            .map_err(|e| ContainerError::RemoveFailed(e.to_string()))?;

        debug!("Removed sandbox container {}", id);
        Ok(())
    }

    /// Verify a container is running and its CDP endpoint answers.
    pub async fn health_check(&self, id: &str) -> ContainerResult<()> {
        let details = self
            .engine
            .container_inspect(id)
            .await
            .map_err(|e| ContainerError::InspectFailed(e.to_string()))?;

        if details.status != ContainerStatus::Running {
            return Err(ContainerError::Unhealthy(format!(
                "container {} is {}",
                id, details.status
            )));
        }

        let port = details.host_port.ok_or_else(|| {
            ContainerError::Unhealthy(format!("container {} has no mapped debug port", id))
        })?;

        let url = format!("http://127.0.0.1:{}/json/version", port);
        let response = self
            .probe
            .get(&url)
            .send()
            .await
            .map_err(|e| ContainerError::Unhealthy(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ContainerError::Unhealthy(format!(
                "debug endpoint returned {}",
                response.status()
            )));
        }

        Ok(())
    }

    /// The configuration this manager creates containers from
    pub fn config(&self) -> &ContainerConfiguration {
        &self.config
    }
}
