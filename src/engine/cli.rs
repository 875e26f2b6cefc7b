//! CLI engine driver
//!
//! Drives the engine through the docker binary. Inspect output is requested
//! as three pipe-separated fields: `<container_id>|<status>|<host_port>`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::traits::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerStatus, EngineError, EngineResult,
    DEBUG_PORT,
};

/// Engine driver shelling out to the docker binary
#[derive(Debug, Clone)]
pub struct CliEngine {
    binary: String,
}

impl CliEngine {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run the binary with the given arguments, returning trimmed stdout.
    async fn run(&self, args: &[&str]) -> EngineResult<String> {
        debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") || stderr.contains("not found") {
                return Err(EngineError::NotFound(stderr.trim().to_string()));
            }
            return Err(EngineError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Format a CPU share for `--cpus`, truncated to one decimal place.
    fn format_cpus(share: f64) -> String {
        format!("{:.1}", (share * 10.0).trunc() / 10.0)
    }

    /// Parse the three-field inspect line.
    fn parse_inspect(line: &str) -> EngineResult<ContainerDetails> {
        let parts: Vec<&str> = line.splitn(3, '|').collect();
        if parts.len() != 3 {
            return Err(EngineError::InvalidFormat(line.to_string()));
        }

        let id = parts[0].trim();
        if id.is_empty() {
            return Err(EngineError::InvalidFormat(line.to_string()));
        }

        Ok(ContainerDetails {
            id: id.to_string(),
            status: ContainerStatus::from(parts[1].trim()),
            host_port: parts[2].trim().parse::<u16>().ok(),
        })
    }
}

impl Default for CliEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for CliEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.run(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn network_inspect(&self, name: &str) -> EngineResult<()> {
        self.run(&["network", "inspect", "--format", "{{.Id}}", name])
            .await?;
        Ok(())
    }

    async fn network_create(&self, name: &str) -> EngineResult<()> {
        self.run(&["network", "create", "--driver", "bridge", name])
            .await?;
        info!("Created network {}", name);
        Ok(())
    }

    async fn image_inspect(&self, image: &str) -> EngineResult<()> {
        self.run(&["image", "inspect", "--format", "{{.Id}}", image])
            .await?;
        Ok(())
    }

    async fn image_pull(&self, image: &str) -> EngineResult<()> {
        self.run(&["pull", image])
            .await
            .map_err(|e| EngineError::ImagePull(e.to_string()))?;
        info!("Pulled image {}", image);
        Ok(())
    }

    async fn container_create(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let memory = spec.memory_bytes.to_string();
        let cpus = Self::format_cpus(spec.cpu_share);
        let pids = spec.pid_limit.to_string();
        let tmpfs = format!("/tmp:size={}", spec.tmpfs_size);
        let publish = format!("127.0.0.1:0:{}", DEBUG_PORT);

        let mut args = vec![
            "create",
            "--name",
            spec.name.as_str(),
            "--network",
            spec.network.as_str(),
            "--memory",
            memory.as_str(),
            "--cpus",
            cpus.as_str(),
            "--pids-limit",
            pids.as_str(),
            "--tmpfs",
            tmpfs.as_str(),
            "--user",
            spec.user.as_str(),
            "--publish",
            publish.as_str(),
        ];
        if spec.read_only_rootfs {
            args.push("--read-only");
        }
        args.push(spec.image.as_str());

        let id = self.run(&args).await?;
        Ok(id)
    }

    async fn container_start(&self, id: &str) -> EngineResult<()> {
        self.run(&["start", id]).await?;
        Ok(())
    }

    async fn container_stop(&self, id: &str, timeout: Duration) -> EngineResult<()> {
        let secs = timeout.as_secs().to_string();
        self.run(&["stop", "--time", &secs, id]).await?;
        Ok(())
    }

    async fn container_remove(&self, id: &str, force: bool) -> EngineResult<()> {
        if force {
            self.run(&["rm", "--force", "--volumes", id]).await?;
        } else {
            self.run(&["rm", "--volumes", id]).await?;
        }
        Ok(())
    }

    async fn container_inspect(&self, id: &str) -> EngineResult<ContainerDetails> {
        let format = format!(
            "{{{{.Id}}}}|{{{{.State.Status}}}}|{{{{(index (index .NetworkSettings.Ports \"{}/tcp\") 0).HostPort}}}}",
            DEBUG_PORT
        );

        let line = self.run(&["inspect", "--format", &format, id]).await?;
        Self::parse_inspect(&line)
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_three_fields() {
        let details = CliEngine::parse_inspect("abc123|running|49153").unwrap();
        assert_eq!(details.id, "abc123");
        assert_eq!(details.status, ContainerStatus::Running);
        assert_eq!(details.host_port, Some(49153));
    }

    #[test]
    fn test_parse_inspect_unknown_status_and_port() {
        let details = CliEngine::parse_inspect("abc123|paused|").unwrap();
        assert_eq!(details.status, ContainerStatus::Other);
        assert_eq!(details.host_port, None);

        let details = CliEngine::parse_inspect("abc123|exited|0").unwrap();
        assert_eq!(details.status, ContainerStatus::Exited);
    }

    #[test]
    fn test_parse_inspect_missing_fields() {
        assert!(matches!(
            CliEngine::parse_inspect("abc123|running"),
            Err(EngineError::InvalidFormat(_))
        ));
        assert!(matches!(
            CliEngine::parse_inspect("abc123"),
            Err(EngineError::InvalidFormat(_))
        ));
        assert!(matches!(
            CliEngine::parse_inspect(""),
            Err(EngineError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_parse_inspect_extra_separator_goes_to_port_field() {
        // splitn(3) keeps everything after the second separator in the
        // third field; an unparseable port is reported as absent.
        let details = CliEngine::parse_inspect("abc|running|49153|extra").unwrap();
        assert_eq!(details.host_port, None);
    }

    #[test]
    fn test_format_cpus_truncates() {
        assert_eq!(CliEngine::format_cpus(0.25), "0.2");
        assert_eq!(CliEngine::format_cpus(1.0), "1.0");
        assert_eq!(CliEngine::format_cpus(1.99), "1.9");
        assert_eq!(CliEngine::format_cpus(0.5), "0.5");
    }
}
