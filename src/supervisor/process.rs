//! Capability server process supervision

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace window between the termination signal and the hard kill
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a stopping process to exit
const STOP_POLL: Duration = Duration::from_millis(100);

/// Poll interval of the exit waiter task
const WAIT_POLL: Duration = Duration::from_millis(500);

/// Error type for supervisor operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("No configuration for capability server {0}")]
    NotFound(String),

    #[error("Capability server start failed: {0}")]
    StartFailed(String),

    #[error("Capability server stop failed: {0}")]
    StopFailed(String),

    #[error("Required binary not on PATH: {0}")]
    MissingBinary(String),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Description of a capability server
#[derive(Debug, Clone, Default)]
pub struct CapabilityServerConfig {
    /// Executable to launch
    pub command: String,

    /// Arguments
    pub args: Vec<String>,

    /// Environment additions on top of the inherited environment
    pub env: HashMap<String, String>,

    /// Working directory
    pub working_dir: Option<PathBuf>,

    /// Optional auxiliary binary that must be on PATH before launch
    pub requires_binary: Option<String>,

    /// TCP port the server listens on, when it has one
    pub port: Option<u16>,
}

/// Handle to a running capability server
struct ServerHandle {
    name: String,
    pid: u32,
    port: Option<u16>,
    command: String,
    started_at: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    child: tokio::sync::Mutex<Option<Child>>,
}

/// Snapshot of a running server
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub pid: u32,
    pub port: Option<u16>,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub uptime: Duration,
}

/// Supervisor for capability server child processes
///
/// The handle map is the single source of truth for what is running; the
/// exit waiter drops handles whose process has gone away.
pub struct ProcessSupervisor {
    configs: RwLock<HashMap<String, CapabilityServerConfig>>,
    handles: Mutex<HashMap<String, Arc<ServerHandle>>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Register a named server configuration.
    pub fn register(&self, name: &str, config: CapabilityServerConfig) {
        self.configs.write().insert(name.to_string(), config);
    }

    /// Remove a registered configuration.
    pub fn unregister(&self, name: &str) {
        self.configs.write().remove(name);
    }

    /// Whether a configuration is registered for `name`.
    pub fn is_available(&self, name: &str) -> bool {
        self.configs.read().contains_key(name)
    }

    /// Start a capability server.
    ///
    /// Idempotent: an already-running server is returned as-is. The
    /// configuration comes from `config_override` when given, else from the
    /// registered configuration for `name`.
    pub async fn start(
        self: &Arc<Self>,
        name: &str,
        config_override: Option<CapabilityServerConfig>,
    ) -> SupervisorResult<ServerInfo> {
        {
            let mut handles = self.handles.lock();
            if let Some(handle) = handles.get(name) {
                if process_alive(handle.pid) {
                    debug!("Capability server {} already running", name);
                    return Ok(handle.info());
                }
                // Stale handle from an exited process.
                handles.remove(name);
            }
        }

        let config = match config_override {
            Some(config) => config,
            None => self
                .configs
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?,
        };

        if let Some(required) = &config.requires_binary {
            if resolve_binary(required).is_none() {
                return Err(SupervisorError::MissingBinary(required.clone()));
            }
        }

        let executable = resolve_binary(&config.command)
            .ok_or_else(|| SupervisorError::MissingBinary(config.command.clone()))?;

        let mut command = Command::new(&executable);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }
        // Own process group so termination signals reach descendants.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::StartFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::StartFailed("no pid for spawned child".to_string()))?;

        // Pump output into the logging sink.
        if let Some(stdout) = child.stdout.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(server = %server, "{}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(server = %server, "{}", line);
                }
            });
        }

        let handle = Arc::new(ServerHandle {
            name: name.to_string(),
            pid,
            port: config.port,
            command: config.command.clone(),
            started_at: Utc::now(),
            started: Instant::now(),
            cancel: CancellationToken::new(),
            child: tokio::sync::Mutex::new(Some(child)),
        });

        self.handles
            .lock()
            .insert(name.to_string(), handle.clone());
        self.spawn_waiter(handle.clone());

        info!("Started capability server {} (pid {})", name, pid);
        Ok(handle.info())
    }

    /// Watch for process exit; abnormal exits are logged and the handle is
    /// dropped so the map only ever holds live servers.
    fn spawn_waiter(self: &Arc<Self>, handle: Arc<ServerHandle>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handle.cancel.cancelled() => return,
                    _ = tokio::time::sleep(WAIT_POLL) => {}
                }

                let status = {
                    let mut child = handle.child.lock().await;
                    match child.as_mut() {
                        Some(c) => match c.try_wait() {
                            Ok(Some(status)) => Some(status),
                            Ok(None) => None,
                            Err(e) => {
                                warn!("Wait failed for server {}: {}", handle.name, e);
                                return;
                            }
                        },
                        None => return,
                    }
                };

                if let Some(status) = status {
                    if status.success() {
                        info!("Capability server {} exited cleanly", handle.name);
                    } else {
                        warn!(
                            "Capability server {} exited abnormally: {}",
                            handle.name, status
                        );
                    }

                    let mut handles = supervisor.handles.lock();
                    if let Some(current) = handles.get(&handle.name) {
                        if Arc::ptr_eq(current, &handle) {
                            handles.remove(&handle.name);
                        }
                    }
                    return;
                }
            }
        });
    }

    /// Stop a server gracefully, killing it after the grace window.
    pub async fn stop(&self, name: &str) -> SupervisorResult<()> {
        let handle = self
            .handles
            .lock()
            .remove(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        handle.cancel.cancel();

        let mut child = handle.child.lock().await;
        let child = match child.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };

        terminate_gracefully(handle.pid, child);

        let deadline = Instant::now() + STOP_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Capability server {} stopped: {}", name, status);
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => return Err(SupervisorError::StopFailed(e.to_string())),
            }

            if Instant::now() >= deadline {
                warn!("Capability server {} outlived grace window, killing", name);
                child
                    .kill()
                    .await
                    .map_err(|e| SupervisorError::StopFailed(e.to_string()))?;
                return Ok(());
            }

            tokio::time::sleep(STOP_POLL).await;
        }
    }

    /// Kill a server immediately. Noop if it is not running.
    pub async fn force_stop(&self, name: &str) {
        let handle = match self.handles.lock().remove(name) {
            Some(h) => h,
            None => return,
        };

        handle.cancel.cancel();

        let mut child = handle.child.lock().await;
        if let Some(child) = child.as_mut() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill capability server {}: {}", name, e);
            }
        }
        info!("Force-stopped capability server {}", name);
    }

    /// Stop every running server, best effort.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.handles.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!("Failed to stop capability server {}: {}", name, e);
            }
        }
    }

    /// Whether a server's handle exists and its process is alive.
    ///
    /// On Windows, handle presence stands in for liveness; zombie states are
    /// not distinguished there.
    pub fn health_check(&self, name: &str) -> bool {
        self.handles
            .lock()
            .get(name)
            .map(|handle| process_alive(handle.pid))
            .unwrap_or(false)
    }

    /// Snapshot of all running servers
    pub fn list_running(&self) -> Vec<ServerInfo> {
        self.handles
            .lock()
            .values()
            .map(|handle| handle.info())
            .collect()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandle {
    fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            pid: self.pid,
            port: self.port,
            command: self.command.clone(),
            started_at: self.started_at,
            uptime: self.started.elapsed(),
        }
    }
}

/// Send the graceful termination signal.
///
/// On Unix the whole process group is signalled so descendants stop too.
#[cfg(unix)]
fn terminate_gracefully(pid: u32, _child: &mut Child) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(_pid: u32, child: &mut Child) {
    let _ = child.start_kill();
}

/// Null-signal liveness probe.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Handle presence stands in for liveness on Windows.
#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Resolve a command on PATH. Absolute and relative paths are checked
/// directly.
fn resolve_binary(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let full = dir.join(command);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}
