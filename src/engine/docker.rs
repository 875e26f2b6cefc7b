//! Library engine driver (bollard)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::{debug, info};

use super::traits::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerStatus, EngineError, EngineResult,
    DEBUG_PORT,
};

/// CFS scheduling granularity: one core per second, in nanoseconds
const NANO_CPUS_PER_CORE: f64 = 1_000_000_000.0;

/// Engine driver speaking the engine API directly
#[derive(Clone)]
pub struct DockerEngine {
    client: Arc<Docker>,
}

impl DockerEngine {
    pub fn new() -> EngineResult<Self> {
        let client = Docker::connect_with_local_defaults()?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn with_socket(socket_path: &str) -> EngineResult<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn map_not_found(id: &str, e: bollard::errors::Error) -> EngineError {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => EngineError::NotFound(id.to_string()),
            _ => EngineError::Docker(e),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.client
            .ping()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn network_inspect(&self, name: &str) -> EngineResult<()> {
        self.client
            .inspect_network::<String>(name, None)
            .await
            .map_err(|e| Self::map_not_found(name, e))?;
        Ok(())
    }

    async fn network_create(&self, name: &str) -> EngineResult<()> {
        let options = CreateNetworkOptions {
            name,
            driver: "bridge",
            ..Default::default()
        };

        self.client.create_network(options).await?;
        info!("Created network {}", name);
        Ok(())
    }

    async fn image_inspect(&self, image: &str) -> EngineResult<()> {
        self.client
            .inspect_image(image)
            .await
            .map_err(|e| Self::map_not_found(image, e))?;
        Ok(())
    }

    async fn image_pull(&self, image: &str) -> EngineResult<()> {
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull: {}", status);
                    }
                }
                Err(e) => return Err(EngineError::ImagePull(e.to_string())),
            }
        }

        info!("Pulled image {}", image);
        Ok(())
    }

    async fn container_create(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let debug_port_key = format!("{}/tcp", DEBUG_PORT);

        // Host port left at 0 so the engine assigns a random one, bound to
        // loopback where the CDP probe reaches it.
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            debug_port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("0".to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(debug_port_key, HashMap::new());

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), format!("size={}", spec.tmpfs_size));

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            memory: Some(spec.memory_bytes as i64),
            nano_cpus: Some((spec.cpu_share * NANO_CPUS_PER_CORE) as i64),
            pids_limit: Some(spec.pid_limit),
            tmpfs: Some(tmpfs),
            readonly_rootfs: Some(spec.read_only_rootfs),
            network_mode: Some(spec.network.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            user: Some(spec.user.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });

        let response = self.client.create_container(options, config).await?;

        Ok(response.id)
    }

    async fn container_start(&self, id: &str) -> EngineResult<()> {
        self.client
            .start_container::<String>(id, None)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;
        Ok(())
    }

    async fn container_stop(&self, id: &str, timeout: Duration) -> EngineResult<()> {
        let options = Some(StopContainerOptions {
            t: timeout.as_secs() as i64,
        });

        self.client
            .stop_container(id, options)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;
        Ok(())
    }

    async fn container_remove(&self, id: &str, force: bool) -> EngineResult<()> {
        let options = Some(RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        });

        self.client
            .remove_container(id, options)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;
        Ok(())
    }

    async fn container_inspect(&self, id: &str) -> EngineResult<ContainerDetails> {
        let inspect = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;

        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| ContainerStatus::from(format!("{:?}", s).to_lowercase().as_str()))
            .unwrap_or(ContainerStatus::Other);

        let debug_port_key = format!("{}/tcp", DEBUG_PORT);
        let host_port = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(&debug_port_key).cloned().flatten())
            .and_then(|bindings| bindings.first().cloned())
            .and_then(|binding| binding.host_port)
            .and_then(|port| port.parse::<u16>().ok());

        Ok(ContainerDetails {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            status,
            host_port,
        })
    }

    async fn close(&self) -> EngineResult<()> {
        // The API client holds no resources that need explicit teardown.
        Ok(())
    }
}
