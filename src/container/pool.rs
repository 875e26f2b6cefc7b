//! Bounded container pool with warm pre-creation
//!
//! The pool amortizes container creation latency by keeping a FIFO of warm
//! containers ready for assignment, enforces a hard bound on warm + active,
//! and replaces unhealthy active containers in a background sweep.
//!
//! Lock discipline: a single mutex guards warm, active and the shutdown
//! flag. The lock is never held across engine calls; capacity and shutdown
//! are re-validated after every reacquisition.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::{ContainerDescriptor, ContainerManager};
use crate::config::PoolConfiguration;

/// Tick interval of the warm replenisher
const REPLENISH_INTERVAL: Duration = Duration::from_secs(5);

/// Tick interval of the active health monitor
const HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive probe failures before an active container is replaced
const HEALTH_FAILURE_LIMIT: u32 = 3;

/// Error type for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Container pool exhausted (max: {0})")]
    Exhausted(usize),

    #[error("Container pool is shut down")]
    ShutDown,

    #[error("Session {0} already holds a container")]
    AlreadyAcquired(String),

    #[error("Session {0} holds no container")]
    NotAcquired(String),

    #[error("Container creation failed: {0}")]
    CreateFailed(String),

    #[error("Container destruction failed: {0}")]
    DestroyFailed(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Validated pool sizing, clamped at construction
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_containers: usize,
    pub warm_target: usize,
    pub idle_timeout: Duration,
}

impl PoolConfig {
    /// Build from raw configuration values, clamping out-of-range sizes.
    pub fn new(max_containers: i64, warm_target: i64, idle_timeout: Duration) -> Self {
        let max = if max_containers <= 0 {
            5
        } else {
            max_containers as usize
        };
        let warm = warm_target.max(0) as usize;

        Self {
            max_containers: max,
            warm_target: warm.min(max),
            idle_timeout,
        }
    }

    pub fn from_configuration(config: &PoolConfiguration) -> Self {
        Self::new(
            config.max_containers,
            config.warm_pool_size,
            config.idle_timeout_duration(),
        )
    }
}

/// Pre-created container awaiting assignment
struct WarmEntry {
    descriptor: ContainerDescriptor,
    created: Instant,
}

/// Container assigned to a session
struct ActiveEntry {
    descriptor: ContainerDescriptor,
    assigned: Instant,
}

#[derive(Default)]
struct PoolState {
    warm: VecDeque<WarmEntry>,
    active: HashMap<String, ActiveEntry>,
    shutdown: bool,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub warm_count: usize,
    pub active_count: usize,
    pub max_count: usize,
}

/// Bounded pool of sandbox containers
pub struct ContainerPool {
    manager: Arc<ContainerManager>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl ContainerPool {
    pub fn new(manager: Arc<ContainerManager>, config: PoolConfig) -> Self {
        Self {
            manager,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Assign a container to a session, preferring the oldest warm one.
    ///
    /// Creates a new container when the warm list is empty and capacity
    /// remains. The state lock is released during creation; shutdown and
    /// the max bound are re-checked once it is reacquired.
    pub async fn acquire(&self, session_id: &str) -> PoolResult<ContainerDescriptor> {
        {
            let mut state = self.state.lock();

            if state.shutdown {
                return Err(PoolError::ShutDown);
            }
            if state.active.contains_key(session_id) {
                return Err(PoolError::AlreadyAcquired(session_id.to_string()));
            }

            if let Some(entry) = state.warm.pop_front() {
                let descriptor = entry.descriptor.clone();
                state.active.insert(
                    session_id.to_string(),
                    ActiveEntry {
                        descriptor: entry.descriptor,
                        assigned: Instant::now(),
                    },
                );
                debug!(
                    "Session {} acquired warm container {}",
                    session_id, descriptor.id
                );
                return Ok(descriptor);
            }

            if state.warm.len() + state.active.len() >= self.config.max_containers {
                return Err(PoolError::Exhausted(self.config.max_containers));
            }
        }

        // Creation is I/O-bound; run it without the lock.
        let descriptor = self
            .manager
            .create()
            .await
            .map_err(|e| PoolError::CreateFailed(e.to_string()))?;

        let stranded = {
            let mut state = self.state.lock();

            if state.shutdown {
                Some(PoolError::ShutDown)
            } else if state.active.contains_key(session_id) {
                Some(PoolError::AlreadyAcquired(session_id.to_string()))
            } else if state.warm.len() + state.active.len() >= self.config.max_containers {
                Some(PoolError::Exhausted(self.config.max_containers))
            } else {
                state.active.insert(
                    session_id.to_string(),
                    ActiveEntry {
                        descriptor: descriptor.clone(),
                        assigned: Instant::now(),
                    },
                );
                None
            }
        };

        if let Some(err) = stranded {
            warn!(
                "Destroying stranded container {} for session {}: {}",
                descriptor.id, session_id, err
            );
            if let Err(e) = self.manager.remove(&descriptor.id).await {
                warn!("Failed to destroy stranded container: {}", e);
            }
            return Err(err);
        }

        debug!(
            "Session {} acquired new container {}",
            session_id, descriptor.id
        );
        Ok(descriptor)
    }

    /// Release a session's container and destroy it.
    ///
    /// The active entry is removed even when destruction fails.
    pub async fn release(&self, session_id: &str) -> PoolResult<()> {
        let entry = {
            let mut state = self.state.lock();
            state
                .active
                .remove(session_id)
                .ok_or_else(|| PoolError::NotAcquired(session_id.to_string()))?
        };

        debug!(
            "Session {} released container {} after {:?}",
            session_id,
            entry.descriptor.id,
            entry.assigned.elapsed()
        );

        self.manager
            .remove(&entry.descriptor.id)
            .await
            .map_err(|e| PoolError::DestroyFailed(e.to_string()))
    }

    /// Shut the pool down, destroying all warm and active containers.
    ///
    /// Idempotent: a second call is a no-op.
    pub async fn shutdown(&self) -> PoolResult<()> {
        let ids: Vec<String> = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Ok(());
            }
            state.shutdown = true;

            let warm_ids: Vec<String> =
                state.warm.drain(..).map(|e| e.descriptor.id).collect();
            let active_ids: Vec<String> =
                state.active.drain().map(|(_, e)| e.descriptor.id).collect();
            warm_ids.into_iter().chain(active_ids).collect()
        };

        info!("Shutting down pool, destroying {} containers", ids.len());

        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self.manager.remove(&id).await {
                failures.push(format!("{}: {}", id, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::DestroyFailed(failures.join("; ")))
        }
    }

    /// Destroy containers left over from an earlier run.
    ///
    /// Individual failures are logged; the sweep always completes.
    pub async fn cleanup_orphaned(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = self.manager.remove(id).await {
                warn!("Failed to clean up orphaned container {}: {}", id, e);
            }
        }
    }

    /// Snapshot of current occupancy
    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            warm_count: state.warm.len(),
            active_count: state.active.len(),
            max_count: self.config.max_containers,
        }
    }

    /// Spawn the warm replenisher loop.
    pub fn spawn_replenisher(self: &Arc<Self>, ctx: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REPLENISH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        debug!("Warm replenisher cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        pool.replenish_once().await;
                    }
                }
            }
        })
    }

    /// Spawn the active-container health monitor loop.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        ctx: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut fail_counts: HashMap<String, u32> = HashMap::new();
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        debug!("Pool health monitor cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        pool.health_sweep_once(&mut fail_counts).await;
                    }
                }
            }
        })
    }

    /// One replenisher tick: evict expired warm containers, then create up
    /// to `min(needed, available)` fresh ones. Any creation error aborts the
    /// rest of the tick.
    async fn replenish_once(&self) {
        let (expired, needed, available) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }

            let idle_timeout = self.config.idle_timeout;
            let mut expired = Vec::new();
            let mut remaining = VecDeque::with_capacity(state.warm.len());
            for entry in state.warm.drain(..) {
                if entry.created.elapsed() > idle_timeout {
                    expired.push(entry.descriptor.id);
                } else {
                    remaining.push_back(entry);
                }
            }
            state.warm = remaining;

            let occupancy = state.warm.len() + state.active.len();
            let needed = self.config.warm_target.saturating_sub(state.warm.len());
            let available = self.config.max_containers.saturating_sub(occupancy);
            (expired, needed, available)
        };

        for id in expired {
            debug!("Evicting idle warm container {}", id);
            if let Err(e) = self.manager.remove(&id).await {
                warn!("Failed to destroy idle warm container {}: {}", id, e);
            }
        }

        for _ in 0..needed.min(available) {
            let descriptor = match self.manager.create().await {
                Ok(d) => d,
                Err(e) => {
                    warn!("Warm replenish create failed, aborting tick: {}", e);
                    return;
                }
            };

            let stranded = {
                let mut state = self.state.lock();
                if state.shutdown {
                    true
                } else {
                    state.warm.push_back(WarmEntry {
                        descriptor: descriptor.clone(),
                        created: Instant::now(),
                    });
                    false
                }
            };

            if stranded {
                warn!(
                    "Pool shut down during replenish, destroying {}",
                    descriptor.id
                );
                if let Err(e) = self.manager.remove(&descriptor.id).await {
                    warn!("Failed to destroy stranded warm container: {}", e);
                }
                return;
            }

            debug!("Replenished warm container {}", descriptor.id);
        }
    }

    /// One health-monitor sweep over the active set.
    ///
    /// Containers failing [`HEALTH_FAILURE_LIMIT`] consecutive probes are
    /// replaced in place; counters for vanished sessions are dropped in a
    /// second pass.
    async fn health_sweep_once(&self, fail_counts: &mut HashMap<String, u32>) {
        let snapshot: Vec<(String, String)> = {
            let state = self.state.lock();
            if state.shutdown {
                fail_counts.clear();
                return;
            }
            state
                .active
                .iter()
                .map(|(session, entry)| (session.clone(), entry.descriptor.id.clone()))
                .collect()
        };

        for (session_id, container_id) in snapshot {
            match self.manager.health_check(&container_id).await {
                Ok(()) => {
                    fail_counts.remove(&session_id);
                }
                Err(e) => {
                    let count = fail_counts.entry(session_id.clone()).or_insert(0);
                    *count += 1;
                    warn!(
                        "Health check failed for container {} (session {}, strike {}): {}",
                        container_id, session_id, count, e
                    );

                    if *count >= HEALTH_FAILURE_LIMIT {
                        self.replace_container(&session_id, &container_id).await;
                        fail_counts.remove(&session_id);
                    }
                }
            }
        }

        // Two-pass cleanup: snapshot surviving sessions, then drop stale
        // counters.
        let active_sessions: HashSet<String> = {
            let state = self.state.lock();
            state.active.keys().cloned().collect()
        };
        fail_counts.retain(|session, _| active_sessions.contains(session));
    }

    /// Replace an unhealthy active container with a freshly created one.
    async fn replace_container(&self, session_id: &str, old_id: &str) {
        info!(
            "Replacing unhealthy container {} for session {}",
            old_id, session_id
        );

        let replacement = match self.manager.create().await {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    "Failed to create replacement for session {}: {}",
                    session_id, e
                );
                return;
            }
        };

        let swapped = {
            let mut state = self.state.lock();
            if state.shutdown {
                false
            } else if let Some(entry) = state.active.get_mut(session_id) {
                entry.descriptor = replacement.clone();
                entry.assigned = Instant::now();
                true
            } else {
                false
            }
        };

        if swapped {
            if let Err(e) = self.manager.remove(old_id).await {
                warn!("Failed to destroy replaced container {}: {}", old_id, e);
            }
            info!(
                "Session {} now on container {}",
                session_id, replacement.id
            );
        } else {
            // Session vanished while we were creating; the replacement is
            // stranded.
            warn!(
                "Session {} vanished during replacement, destroying {}",
                session_id, replacement.id
            );
            if let Err(e) = self.manager.remove(&replacement.id).await {
                warn!("Failed to destroy stranded replacement: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfiguration;
    use crate::engine::{
        ContainerDetails, ContainerEngine, ContainerSpec, ContainerStatus, EngineError,
        EngineResult,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine double that fabricates container ids and records removals.
    #[derive(Default)]
    struct FakeEngine {
        created: AtomicUsize,
        removed: Mutex<Vec<String>>,
        fail_creates: std::sync::atomic::AtomicBool,
    }

    impl FakeEngine {
        fn removed_ids(&self) -> Vec<String> {
            self.removed.lock().clone()
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn ping(&self) -> EngineResult<()> {
            Ok(())
        }

        async fn network_inspect(&self, _name: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn network_create(&self, _name: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn image_inspect(&self, _image: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn image_pull(&self, _image: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn container_create(&self, _spec: &ContainerSpec) -> EngineResult<String> {
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(EngineError::Other("create disabled".into()));
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("container-{}", n))
        }

        async fn container_start(&self, _id: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn container_stop(&self, _id: &str, _timeout: Duration) -> EngineResult<()> {
            Ok(())
        }

        async fn container_remove(&self, id: &str, _force: bool) -> EngineResult<()> {
            self.removed.lock().push(id.to_string());
            Ok(())
        }

        async fn container_inspect(&self, id: &str) -> EngineResult<ContainerDetails> {
            Ok(ContainerDetails {
                id: id.to_string(),
                // Port 1 refuses connections immediately, so health probes
                // fail deterministically without a listener.
                status: ContainerStatus::Running,
                host_port: Some(1),
            })
        }

        async fn close(&self) -> EngineResult<()> {
            Ok(())
        }
    }

    async fn pool_with(
        engine: Arc<FakeEngine>,
        max: i64,
        warm: i64,
    ) -> Arc<ContainerPool> {
        let manager = ContainerManager::new(engine, ContainerConfiguration::default())
            .await
            .unwrap();
        Arc::new(ContainerPool::new(
            Arc::new(manager),
            PoolConfig::new(max, warm, Duration::from_secs(300)),
        ))
    }

    #[test]
    fn test_config_clamps() {
        let config = PoolConfig::new(0, 2, Duration::from_secs(1));
        assert_eq!(config.max_containers, 5);

        let config = PoolConfig::new(-3, 2, Duration::from_secs(1));
        assert_eq!(config.max_containers, 5);

        let config = PoolConfig::new(2, 10, Duration::from_secs(1));
        assert_eq!(config.warm_target, 2);

        let config = PoolConfig::new(4, -1, Duration::from_secs(1));
        assert_eq!(config.warm_target, 0);
    }

    #[tokio::test]
    async fn test_acquire_release_reacquire() {
        let engine = Arc::new(FakeEngine::default());
        let pool = pool_with(engine.clone(), 2, 0).await;

        let first = pool.acquire("s1").await.unwrap();
        assert_eq!(pool.status().active_count, 1);

        pool.release("s1").await.unwrap();
        assert_eq!(pool.status().active_count, 0);
        assert!(engine.removed_ids().contains(&first.id));

        pool.acquire("s1").await.unwrap();
        assert_eq!(pool.status().active_count, 1);
    }

    #[tokio::test]
    async fn test_double_acquire_forbidden() {
        let engine = Arc::new(FakeEngine::default());
        let pool = pool_with(engine, 2, 0).await;

        pool.acquire("s1").await.unwrap();
        assert!(matches!(
            pool.acquire("s1").await,
            Err(PoolError::AlreadyAcquired(_))
        ));
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let engine = Arc::new(FakeEngine::default());
        let pool = pool_with(engine, 2, 0).await;

        pool.acquire("s1").await.unwrap();
        pool.acquire("s2").await.unwrap();
        assert!(matches!(
            pool.acquire("s3").await,
            Err(PoolError::Exhausted(2))
        ));
    }

    #[tokio::test]
    async fn test_warm_hit_is_fifo() {
        let engine = Arc::new(FakeEngine::default());
        let pool = pool_with(engine.clone(), 2, 1).await;

        pool.replenish_once().await;
        let status = pool.status();
        assert_eq!(status.warm_count, 1);

        let created_before = engine.created.load(Ordering::SeqCst);
        let descriptor = pool.acquire("s1").await.unwrap();

        // Served from warm: no new create.
        assert_eq!(engine.created.load(Ordering::SeqCst), created_before);
        assert_eq!(descriptor.id, "container-0");
        assert_eq!(
            pool.status(),
            PoolStatus {
                warm_count: 0,
                active_count: 1,
                max_count: 2
            }
        );
    }

    #[tokio::test]
    async fn test_replenisher_respects_max() {
        let engine = Arc::new(FakeEngine::default());
        let pool = pool_with(engine, 2, 2).await;

        pool.acquire("s1").await.unwrap();
        pool.replenish_once().await;

        // warm_target is 2 but only one slot remains under max.
        let status = pool.status();
        assert_eq!(status.warm_count, 1);
        assert_eq!(status.active_count, 1);
    }

    #[tokio::test]
    async fn test_replenisher_aborts_tick_on_create_error() {
        let engine = Arc::new(FakeEngine::default());
        let pool = pool_with(engine.clone(), 5, 3).await;

        engine.fail_creates.store(true, Ordering::SeqCst);
        pool.replenish_once().await;
        assert_eq!(pool.status().warm_count, 0);

        engine.fail_creates.store(false, Ordering::SeqCst);
        pool.replenish_once().await;
        assert_eq!(pool.status().warm_count, 3);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_destroys_everything() {
        let engine = Arc::new(FakeEngine::default());
        let pool = pool_with(engine.clone(), 4, 2).await;

        pool.replenish_once().await;
        pool.acquire("s1").await.unwrap();

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status().warm_count, 0);
        assert_eq!(pool.status().active_count, 0);
        assert_eq!(engine.removed_ids().len(), 3);

        // Second call has no further effect.
        pool.shutdown().await.unwrap();
        assert_eq!(engine.removed_ids().len(), 3);

        assert!(matches!(pool.acquire("s2").await, Err(PoolError::ShutDown)));
    }

    #[tokio::test]
    async fn test_health_sweep_replaces_after_three_strikes() {
        let engine = Arc::new(FakeEngine::default());
        let pool = pool_with(engine.clone(), 2, 0).await;

        let original = pool.acquire("s1").await.unwrap();
        let mut fail_counts = HashMap::new();

        // Probes hit port 1 where nothing listens, so every sweep is a
        // strike.
        pool.health_sweep_once(&mut fail_counts).await;
        pool.health_sweep_once(&mut fail_counts).await;
        assert!(engine.removed_ids().is_empty());

        pool.health_sweep_once(&mut fail_counts).await;
        assert!(engine.removed_ids().contains(&original.id));

        let status = pool.status();
        assert_eq!(status.active_count, 1);
        assert!(fail_counts.is_empty());
    }

    #[tokio::test]
    async fn test_health_sweep_drops_counters_for_vanished_sessions() {
        let engine = Arc::new(FakeEngine::default());
        let pool = pool_with(engine, 2, 0).await;

        pool.acquire("s1").await.unwrap();
        let mut fail_counts = HashMap::new();
        pool.health_sweep_once(&mut fail_counts).await;
        assert_eq!(fail_counts.get("s1"), Some(&1));

        pool.release("s1").await.unwrap();
        pool.health_sweep_once(&mut fail_counts).await;
        assert!(fail_counts.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_orphaned_never_fails() {
        let engine = Arc::new(FakeEngine::default());
        let pool = pool_with(engine.clone(), 2, 0).await;

        pool.cleanup_orphaned(&["stale-1".to_string(), "stale-2".to_string()])
            .await;
        assert_eq!(engine.removed_ids(), vec!["stale-1", "stale-2"]);
    }
}
