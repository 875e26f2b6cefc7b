//! Capability server health aggregation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::process::{ProcessSupervisor, ServerInfo};

/// Calls required before the error-rate rule can mark a server degraded
const ERROR_MIN_CALLS: u64 = 10;

/// Error rate above which a running server is reported as `error`
const ERROR_RATE_THRESHOLD: f64 = 0.5;

/// Derived status of a capability server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Running => write!(f, "running"),
            ServerStatus::Stopped => write!(f, "stopped"),
            ServerStatus::Error => write!(f, "error"),
        }
    }
}

/// Rolling per-server call statistics
#[derive(Debug, Clone, Default)]
struct ServerStats {
    total_calls: u64,
    error_count: u64,
    total_response_ms: u64,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

/// Per-server entry of a health report
#[derive(Debug, Clone)]
pub struct ServerHealth {
    pub name: String,
    pub status: ServerStatus,
    pub uptime_secs: u64,
    pub total_calls: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_response_ms: u64,
    pub last_error: Option<String>,
}

/// Immutable per-tick snapshot emitted to the observer callback
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub servers: Vec<ServerHealth>,
}

/// Observer invoked with each collected report
pub type ReportCallback = Arc<dyn Fn(HealthReport) + Send + Sync>;

/// Aggregates capability server call statistics and emits periodic reports
pub struct HealthMonitor {
    supervisor: Arc<ProcessSupervisor>,
    stats: RwLock<HashMap<String, ServerStats>>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            supervisor,
            stats: RwLock::new(HashMap::new()),
            ticker: Mutex::new(None),
        }
    }

    /// Record one capability call against a server.
    pub fn record_call(&self, name: &str, duration_ms: u64, error: Option<&str>) {
        let mut stats = self.stats.write();
        let entry = stats.entry(name.to_string()).or_default();

        entry.total_calls += 1;
        entry.total_response_ms += duration_ms;
        if let Some(message) = error {
            entry.error_count += 1;
            entry.last_error = Some(message.to_string());
            entry.last_error_at = Some(Utc::now());
        }
    }

    /// Collect a health snapshot over running servers and recorded stats.
    pub fn collect_health(&self) -> HealthReport {
        let running = self.supervisor.list_running();
        let stats = self.stats.read();
        Self::derive(&running, &stats)
    }

    fn derive(running: &[ServerInfo], stats: &HashMap<String, ServerStats>) -> HealthReport {
        let empty = ServerStats::default();
        let mut servers = Vec::new();

        for info in running {
            let stat = stats.get(&info.name).unwrap_or(&empty);
            let error_rate = if stat.total_calls > 0 {
                stat.error_count as f64 / stat.total_calls as f64
            } else {
                0.0
            };

            let status = if stat.total_calls >= ERROR_MIN_CALLS && error_rate > ERROR_RATE_THRESHOLD
            {
                ServerStatus::Error
            } else {
                ServerStatus::Running
            };

            servers.push(ServerHealth {
                name: info.name.clone(),
                status,
                uptime_secs: info.uptime.as_secs(),
                total_calls: stat.total_calls,
                error_count: stat.error_count,
                error_rate,
                avg_response_ms: if stat.total_calls > 0 {
                    stat.total_response_ms / stat.total_calls
                } else {
                    0
                },
                last_error: stat.last_error.clone(),
            });
        }

        // Servers with recorded stats but no live handle report as stopped.
        for (name, stat) in stats {
            if running.iter().any(|info| &info.name == name) {
                continue;
            }

            let error_rate = if stat.total_calls > 0 {
                stat.error_count as f64 / stat.total_calls as f64
            } else {
                0.0
            };

            servers.push(ServerHealth {
                name: name.clone(),
                status: ServerStatus::Stopped,
                uptime_secs: 0,
                total_calls: stat.total_calls,
                error_count: stat.error_count,
                error_rate,
                avg_response_ms: if stat.total_calls > 0 {
                    stat.total_response_ms / stat.total_calls
                } else {
                    0
                },
                last_error: stat.last_error.clone(),
            });
        }

        HealthReport {
            generated_at: Utc::now(),
            servers,
        }
    }

    /// Start the periodic reporter. Each tick collects a report and hands it
    /// to `on_report`.
    pub fn start(
        self: &Arc<Self>,
        ctx: CancellationToken,
        interval: Duration,
        on_report: ReportCallback,
    ) -> tokio::task::JoinHandle<()> {
        let token = ctx.child_token();
        *self.ticker.lock() = Some(token.clone());

        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Capability health monitor cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        on_report(monitor.collect_health());
                    }
                }
            }
        })
    }

    /// Stop the periodic reporter. Idempotent.
    pub fn stop(&self) {
        if let Some(token) = self.ticker.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(name: &str, uptime_secs: u64) -> ServerInfo {
        ServerInfo {
            name: name.to_string(),
            pid: 4242,
            port: None,
            command: "node".to_string(),
            started_at: Utc::now(),
            uptime: Duration::from_secs(uptime_secs),
        }
    }

    fn monitor() -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(Arc::new(ProcessSupervisor::new())))
    }

    #[test]
    fn test_record_call_accumulates() {
        let monitor = monitor();

        monitor.record_call("svc", 100, None);
        monitor.record_call("svc", 200, Some("boom"));

        let stats = monitor.stats.read();
        let stat = stats.get("svc").unwrap();
        assert_eq!(stat.total_calls, 2);
        assert_eq!(stat.error_count, 1);
        assert_eq!(stat.total_response_ms, 300);
        assert_eq!(stat.last_error.as_deref(), Some("boom"));
        assert!(stat.last_error_at.is_some());
    }

    #[test]
    fn test_running_server_reports_running() {
        let monitor = monitor();
        monitor.record_call("svc", 50, None);

        let report =
            HealthMonitor::derive(&[running("svc", 12)], &monitor.stats.read());

        assert_eq!(report.servers.len(), 1);
        let health = &report.servers[0];
        assert_eq!(health.status, ServerStatus::Running);
        assert_eq!(health.uptime_secs, 12);
        assert_eq!(health.avg_response_ms, 50);
    }

    #[test]
    fn test_error_status_requires_volume_and_rate() {
        let monitor = monitor();

        // Nine failing calls: high rate but below the call floor.
        for _ in 0..9 {
            monitor.record_call("svc", 10, Some("err"));
        }
        let report = HealthMonitor::derive(&[running("svc", 1)], &monitor.stats.read());
        assert_eq!(report.servers[0].status, ServerStatus::Running);

        // Tenth failure crosses both thresholds.
        monitor.record_call("svc", 10, Some("err"));
        let report = HealthMonitor::derive(&[running("svc", 1)], &monitor.stats.read());
        assert_eq!(report.servers[0].status, ServerStatus::Error);
        assert_eq!(report.servers[0].error_rate, 1.0);
    }

    #[test]
    fn test_half_error_rate_is_not_degraded() {
        let monitor = monitor();

        for i in 0..20 {
            let error = if i % 2 == 0 { Some("err") } else { None };
            monitor.record_call("svc", 10, error);
        }

        // Exactly 0.5 does not exceed the threshold.
        let report = HealthMonitor::derive(&[running("svc", 1)], &monitor.stats.read());
        assert_eq!(report.servers[0].status, ServerStatus::Running);
    }

    #[test]
    fn test_stats_without_handle_report_stopped() {
        let monitor = monitor();
        monitor.record_call("gone", 10, None);

        let report = HealthMonitor::derive(&[], &monitor.stats.read());
        assert_eq!(report.servers.len(), 1);
        assert_eq!(report.servers[0].status, ServerStatus::Stopped);
        assert_eq!(report.servers[0].uptime_secs, 0);
    }

    #[test]
    fn test_average_is_integer_division() {
        let monitor = monitor();
        monitor.record_call("svc", 10, None);
        monitor.record_call("svc", 15, None);

        let report = HealthMonitor::derive(&[running("svc", 1)], &monitor.stats.read());
        assert_eq!(report.servers[0].avg_response_ms, 12);
    }

    #[tokio::test]
    async fn test_reporter_emits_and_stop_is_idempotent() {
        let monitor = monitor();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let observed = count.clone();
        let handle = monitor.start(
            CancellationToken::new(),
            Duration::from_millis(10),
            Arc::new(move |_report| {
                observed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop();
        monitor.stop();

        let _ = handle.await;
        assert!(count.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }
}
