//! Capability server deployment
//!
//! Materializes a capability server's files and environment onto disk under
//! a configured base directory, then hands the service to the supervisor.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::process::{CapabilityServerConfig, ProcessSupervisor, ServerInfo, SupervisorError};

/// Error type for deployment operations
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Invalid service name: {0}")]
    InvalidName(String),

    #[error("Invalid file path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

pub type DeployResult<T> = Result<T, DeployError>;

/// One file to materialize, relative to the service root
#[derive(Debug, Clone)]
pub struct DeployFile {
    pub path: String,
    pub content: String,
}

/// Deployer for capability servers
pub struct Deployer {
    base: PathBuf,
    supervisor: Arc<ProcessSupervisor>,
}

impl Deployer {
    pub fn new(base: PathBuf, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { base, supervisor }
    }

    /// Lay a service's files and env file onto disk, then start it.
    ///
    /// On start failure the files remain on disk so the caller can inspect
    /// or undeploy.
    pub async fn deploy(
        &self,
        service_name: &str,
        files: &[DeployFile],
        env_vars: &HashMap<String, String>,
    ) -> DeployResult<ServerInfo> {
        validate_service_name(service_name)?;

        let service_dir = self.base.join(service_name);
        tokio::fs::create_dir_all(&service_dir).await?;
        set_permissions(&service_dir, 0o755).await?;

        for file in files {
            let relative = validate_relative_path(&file.path)?;
            let full = service_dir.join(relative);

            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, &file.content).await?;
            set_permissions(&full, 0o644).await?;
        }

        if !env_vars.is_empty() {
            let mut dotenv = String::new();
            for (key, value) in env_vars {
                dotenv.push_str(&format!("{}={}\n", key, value));
            }
            let env_path = service_dir.join(".env");
            tokio::fs::write(&env_path, dotenv).await?;
            set_permissions(&env_path, 0o644).await?;
        }

        let config = self.derive_config(&service_dir, env_vars.clone());
        self.supervisor.register(service_name, config.clone());

        info!(
            "Deployed capability server {} ({} files)",
            service_name,
            files.len()
        );

        let info = self.supervisor.start(service_name, Some(config)).await?;
        Ok(info)
    }

    /// Derive the supervisor configuration for a materialized service.
    ///
    /// A `package.json` at the service root means the project defines its
    /// own start script; otherwise the TypeScript entry point is run through
    /// the PATH's tooling.
    fn derive_config(
        &self,
        service_dir: &Path,
        env: HashMap<String, String>,
    ) -> CapabilityServerConfig {
        let (command, args) = if service_dir.join("package.json").is_file() {
            ("npm".to_string(), vec!["start".to_string()])
        } else {
            (
                "npx".to_string(),
                vec!["tsx".to_string(), "src/index.ts".to_string()],
            )
        };

        CapabilityServerConfig {
            command,
            args,
            env,
            working_dir: Some(service_dir.to_path_buf()),
            requires_binary: None,
            port: None,
        }
    }

    /// Stop a service (best effort) and remove its directory.
    pub async fn undeploy(&self, service_name: &str) -> DeployResult<()> {
        validate_service_name(service_name)?;

        if let Err(e) = self.supervisor.stop(service_name).await {
            warn!("Stop during undeploy of {} failed: {}", service_name, e);
        }
        self.supervisor.unregister(service_name);

        let service_dir = self.base.join(service_name);
        if service_dir.is_dir() {
            tokio::fs::remove_dir_all(&service_dir).await?;
        }

        info!("Undeployed capability server {}", service_name);
        Ok(())
    }

    /// Names of all deployed services. A missing base directory yields an
    /// empty list.
    pub async fn list_deployed(&self) -> DeployResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn validate_service_name(name: &str) -> DeployResult<()> {
    if name.is_empty()
        || name
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
    {
        return Err(DeployError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Reject absolute paths and parent-directory escapes.
fn validate_relative_path(path: &str) -> DeployResult<&Path> {
    let candidate = Path::new(path);
    if candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(DeployError::InvalidPath(path.to_string()));
    }
    Ok(candidate)
}

#[cfg(unix)]
async fn set_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
