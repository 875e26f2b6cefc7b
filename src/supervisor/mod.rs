//! Capability server supervision
//!
//! Capability servers are child processes exposing extra tools over standard
//! I/O. [`ProcessSupervisor`] starts, monitors and tears them down;
//! [`HealthMonitor`] aggregates per-server call statistics into periodic
//! reports; [`Deployer`] materializes server files on disk and registers
//! them with the supervisor.

mod deploy;
mod health;
mod process;

pub use deploy::{DeployError, DeployFile, Deployer, DeployResult};
pub use health::{HealthMonitor, HealthReport, ReportCallback, ServerHealth, ServerStatus};
pub use process::{
    CapabilityServerConfig, ProcessSupervisor, ServerInfo, SupervisorError, SupervisorResult,
};
