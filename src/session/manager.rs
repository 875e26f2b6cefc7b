//! Session table and lifecycle management

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{Session, SessionState};
use crate::browser::{BackendFactory, BackendSpec};
use crate::config::SessionConfiguration;
use crate::container::ContainerDescriptor;

/// Tick interval of the cleanup loop
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Fallback viewport applied when the controller sends degenerate dimensions
const DEFAULT_VIEWPORT: (u32, u32) = (1280, 720);

/// Error type for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Maximum session count reached ({0})")]
    MaxSessions(usize),

    #[error("Session already exists: {0}")]
    Duplicate(String),

    #[error("Session not found: {0}")]
    NotFound(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Manager for all sessions on this bridge
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    factory: BackendFactory,
    max_sessions: usize,
    idle_timeout: Duration,
    max_active_age: Duration,
    // Serializes creation so the count limit cannot be raced past.
    create_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(config: &SessionConfiguration, factory: BackendFactory) -> Self {
        Self {
            sessions: DashMap::new(),
            factory,
            max_sessions: config.max_sessions,
            idle_timeout: config.idle_timeout_duration(),
            max_active_age: config.max_active_age_duration(),
            create_lock: Mutex::new(()),
        }
    }

    /// Create a session and instantiate its backend.
    ///
    /// Degenerate viewport dimensions are replaced by 1280x720. When a
    /// container is supplied, the backend attaches to its debug endpoint.
    #[allow(clippy::too_many_arguments)]
    pub fn create_session(
        &self,
        execution_id: &str,
        session_id: &str,
        viewport_width: i32,
        viewport_height: i32,
        headless: bool,
        initial_url: Option<String>,
        container: Option<&ContainerDescriptor>,
    ) -> SessionResult<Arc<Session>> {
        let _guard = self.create_lock.lock();

        if self.sessions.contains_key(session_id) {
            return Err(SessionError::Duplicate(session_id.to_string()));
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::MaxSessions(self.max_sessions));
        }

        let width = if viewport_width <= 0 {
            DEFAULT_VIEWPORT.0
        } else {
            viewport_width as u32
        };
        let height = if viewport_height <= 0 {
            DEFAULT_VIEWPORT.1
        } else {
            viewport_height as u32
        };

        let backend = (self.factory)(&BackendSpec {
            host_port: container.map(|c| c.host_port),
            viewport_width: width,
            viewport_height: height,
            headless,
        });

        let session = Arc::new(Session::new(
            session_id.to_string(),
            execution_id.to_string(),
            width,
            height,
            headless,
            initial_url,
            container.map(|c| c.id.clone()),
            backend,
        ));

        self.sessions
            .insert(session_id.to_string(), session.clone());

        info!(
            "Created session {} ({}x{}, headless: {})",
            session_id, width, height, headless
        );
        Ok(session)
    }

    /// Snapshot lookup
    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|r| r.value().clone())
    }

    /// Close a session's backend and remove it from the table.
    pub async fn end_session(&self, session_id: &str) -> SessionResult<()> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        session.set_state(SessionState::Closing);
        if let Err(e) = session.backend().close().await {
            warn!("Error closing backend for session {}: {}", session_id, e);
        }
        session.set_state(SessionState::Closed);

        info!("Ended session {}", session_id);
        Ok(())
    }

    /// Update a session's activity timestamp.
    pub fn touch_session(&self, session_id: &str) -> SessionResult<()> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.touch();
        Ok(())
    }

    /// Snapshot of all sessions
    pub fn get_active_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|r| r.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Spawn the eviction loop. On cancellation, all remaining sessions are
    /// closed before the task returns.
    pub fn spawn_cleanup(self: &Arc<Self>, ctx: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        debug!("Session cleanup cancelled, closing remaining sessions");
                        manager.close_all().await;
                        return;
                    }
                    _ = ticker.tick() => {
                        manager.cleanup_once().await;
                    }
                }
            }
        })
    }

    /// One eviction sweep: end sessions idle past the idle timeout or older
    /// than the maximum active age.
    pub async fn cleanup_once(&self) -> usize {
        let now = Utc::now();
        let mut expired = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            let idle = (now - session.last_active())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let age = (now - session.created_at).to_std().unwrap_or(Duration::ZERO);

            if idle > self.idle_timeout {
                debug!("Session {} idle for {:?}, evicting", session.session_id, idle);
                expired.push(session.session_id.clone());
            } else if age > self.max_active_age {
                debug!("Session {} aged {:?}, evicting", session.session_id, age);
                expired.push(session.session_id.clone());
            }
        }

        let mut evicted = 0;
        for session_id in expired {
            match self.end_session(&session_id).await {
                Ok(()) => evicted += 1,
                Err(e) => warn!("Failed to evict session {}: {}", session_id, e),
            }
        }

        if evicted > 0 {
            info!("Evicted {} expired sessions", evicted);
        }
        evicted
    }

    /// Close every session. Used at shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        for session_id in ids {
            if let Err(e) = self.end_session(&session_id).await {
                warn!("Failed to close session {}: {}", session_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MockBackend;

    fn manager_with(max_sessions: usize, idle: &str, age: &str) -> Arc<SessionManager> {
        let config = SessionConfiguration {
            max_sessions,
            idle_timeout: idle.to_string(),
            max_active_age: age.to_string(),
        };
        let factory: BackendFactory = Arc::new(|_spec| Arc::new(MockBackend::active()));
        Arc::new(SessionManager::new(&config, factory))
    }

    #[test]
    fn test_create_and_duplicate() {
        let manager = manager_with(2, "30m", "2h");

        manager
            .create_session("e1", "s1", 1280, 720, true, None, None)
            .unwrap();

        let err = manager
            .create_session("e1", "s1", 1280, 720, true, None, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::Duplicate(_)));
    }

    #[test]
    fn test_max_sessions_enforced() {
        let manager = manager_with(2, "30m", "2h");

        manager
            .create_session("e1", "s1", 1280, 720, true, None, None)
            .unwrap();
        manager
            .create_session("e1", "s2", 1280, 720, true, None, None)
            .unwrap();

        let err = manager
            .create_session("e1", "s3", 1280, 720, true, None, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::MaxSessions(2)));
    }

    #[test]
    fn test_degenerate_viewport_replaced() {
        let manager = manager_with(2, "30m", "2h");

        let session = manager
            .create_session("e1", "s1", 0, 0, true, None, None)
            .unwrap();
        assert_eq!(session.viewport_width, 1280);
        assert_eq!(session.viewport_height, 720);

        let session = manager
            .create_session("e1", "s2", -5, 600, true, None, None)
            .unwrap();
        assert_eq!(session.viewport_width, 1280);
        assert_eq!(session.viewport_height, 600);
    }

    #[tokio::test]
    async fn test_end_session_twice_reports_not_found() {
        let manager = manager_with(2, "30m", "2h");

        manager
            .create_session("e1", "s1", 1280, 720, true, None, None)
            .unwrap();

        manager.end_session("s1").await.unwrap();
        let err = manager.end_session("s1").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_end_session_allows_reuse_of_id() {
        let manager = manager_with(1, "30m", "2h");

        manager
            .create_session("e1", "s1", 1280, 720, true, None, None)
            .unwrap();
        manager.end_session("s1").await.unwrap();

        manager
            .create_session("e2", "s1", 1280, 720, true, None, None)
            .unwrap();
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn test_touch_unknown_session() {
        let manager = manager_with(2, "30m", "2h");
        assert!(matches!(
            manager.touch_session("ghost"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_evicts_idle_sessions() {
        // Zero idle timeout: everything is immediately expired.
        let manager = manager_with(2, "0s", "2h");

        manager
            .create_session("e1", "s1", 1280, 720, true, None, None)
            .unwrap();
        manager
            .create_session("e1", "s2", 1280, 720, true, None, None)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let evicted = manager.cleanup_once().await;
        assert_eq!(evicted, 2);
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_fresh_sessions() {
        let manager = manager_with(2, "30m", "2h");

        manager
            .create_session("e1", "s1", 1280, 720, true, None, None)
            .unwrap();

        let evicted = manager.cleanup_once().await;
        assert_eq!(evicted, 0);
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let manager = manager_with(2, "30m", "2h");

        manager
            .create_session("e1", "s1", 1280, 720, true, None, None)
            .unwrap();
        manager
            .create_session("e1", "s2", 1280, 720, true, None, None)
            .unwrap();

        manager.close_all().await;
        assert_eq!(manager.count(), 0);
    }
}
