//! Request handler
//!
//! Glues the session manager, container pool and action executor together.
//! Session lifecycle errors surface to the transport; action errors are
//! folded into the result payload.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::types::{ActionRequest, ActionResult, SessionEndRequest, SessionStartRequest};
use crate::action::{ActionExecutor, UrlPolicy};
use crate::container::{ContainerPool, PoolError};
use crate::session::{SessionError, SessionManager, SessionState};

/// Error type for session lifecycle requests
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("URL rejected: {0}")]
    UrlRejected(String),

    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),
}

/// Handler for controller requests
pub struct RequestHandler {
    sessions: Arc<SessionManager>,
    // Sandboxed deployments hand the handler a pool; backend-injected
    // deployments run without one.
    pool: Option<Arc<ContainerPool>>,
    policy: UrlPolicy,
    shutdown: CancellationToken,
}

impl RequestHandler {
    pub fn new(
        sessions: Arc<SessionManager>,
        pool: Option<Arc<ContainerPool>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sessions,
            pool,
            policy: UrlPolicy::new(),
            shutdown,
        }
    }

    /// Open a session: acquire a container (when pooled), create the
    /// session, launch its backend and navigate to the initial URL.
    pub async fn handle_session_start(
        &self,
        request: &SessionStartRequest,
    ) -> Result<(), HandlerError> {
        if let Some(url) = &request.url {
            self.policy
                .validate(url)
                .map_err(|e| HandlerError::UrlRejected(e.to_string()))?;
        }

        let container = match &self.pool {
            Some(pool) => Some(pool.acquire(&request.session_id).await?),
            None => None,
        };

        let session = match self.sessions.create_session(
            &request.execution_id,
            &request.session_id,
            request.viewport_w,
            request.viewport_h,
            request.headless,
            request.url.clone(),
            container.as_ref(),
        ) {
            Ok(session) => session,
            Err(e) => {
                self.release_container(&request.session_id).await;
                return Err(e.into());
            }
        };

        session.set_state(SessionState::Launching);
        if let Err(e) = session.backend().launch(&self.shutdown).await {
            warn!(
                "Launch failed for session {}, tearing down: {}",
                request.session_id, e
            );
            if let Err(end_err) = self.sessions.end_session(&request.session_id).await {
                warn!("Teardown after failed launch: {}", end_err);
            }
            self.release_container(&request.session_id).await;
            return Err(HandlerError::LaunchFailed(e.to_string()));
        }
        session.set_state(SessionState::Active);

        if let Some(url) = &request.url {
            if let Err(e) = session.backend().navigate(url).await {
                warn!(
                    "Initial navigation failed for session {}: {}",
                    request.session_id, e
                );
            }
        }

        session.touch();
        info!("Session {} started", request.session_id);
        Ok(())
    }

    /// Execute a UI action. Always produces a result payload; failures set
    /// `success: false` with the error string.
    pub async fn handle_action(&self, request: &ActionRequest) -> ActionResult {
        let started = Instant::now();

        let session = match self.sessions.get_session(&request.session_id) {
            Some(session) => session,
            None => {
                return ActionResult {
                    execution_id: request.execution_id.clone(),
                    session_id: request.session_id.clone(),
                    success: false,
                    error: Some(format!("Session not found: {}", request.session_id)),
                    screenshot: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    container_id: None,
                };
            }
        };

        session.touch();

        let executor = ActionExecutor::new(session.backend(), self.policy.clone());
        let outcome = executor.execute(&request.action, &request.params).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(screenshot) => ActionResult {
                execution_id: request.execution_id.clone(),
                session_id: request.session_id.clone(),
                success: true,
                error: None,
                screenshot: Some(screenshot),
                duration_ms,
                container_id: session.container_id(),
            },
            Err(e) => ActionResult {
                execution_id: request.execution_id.clone(),
                session_id: request.session_id.clone(),
                success: false,
                error: Some(e.to_string()),
                screenshot: None,
                duration_ms,
                container_id: session.container_id(),
            },
        }
    }

    /// Close a session and release its container.
    pub async fn handle_session_end(
        &self,
        request: &SessionEndRequest,
    ) -> Result<(), HandlerError> {
        self.sessions.end_session(&request.session_id).await?;
        self.release_container(&request.session_id).await;
        info!("Session {} ended", request.session_id);
        Ok(())
    }

    /// Queue a result on its session while the transport is away.
    ///
    /// Returns false when the session no longer exists.
    pub fn queue_result(&self, result: ActionResult) -> bool {
        let session = match self.sessions.get_session(&result.session_id) {
            Some(session) => session,
            None => return false,
        };

        match serde_json::to_value(&result) {
            Ok(payload) => {
                session.queue_result(payload);
                true
            }
            Err(e) => {
                warn!("Failed to encode queued result: {}", e);
                false
            }
        }
    }

    /// Drain a session's queued results for delivery on reconnect.
    pub fn drain_pending(&self, session_id: &str) -> Vec<Value> {
        self.sessions
            .get_session(session_id)
            .map(|session| {
                session
                    .drain_pending()
                    .into_iter()
                    .map(|pending| pending.payload)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.sessions
            .get_session(session_id)
            .map(|session| session.pending_count())
            .unwrap_or(0)
    }

    async fn release_container(&self, session_id: &str) {
        if let Some(pool) = &self.pool {
            match pool.release(session_id).await {
                Ok(()) | Err(PoolError::NotAcquired(_)) => {}
                Err(e) => warn!("Failed to release container for {}: {}", session_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BackendFactory, MockBackend};
    use crate::config::SessionConfiguration;
    use serde_json::json;

    fn handler() -> RequestHandler {
        let factory: BackendFactory = Arc::new(|_spec| Arc::new(MockBackend::new()));
        let sessions = Arc::new(SessionManager::new(
            &SessionConfiguration::default(),
            factory,
        ));
        RequestHandler::new(sessions, None, CancellationToken::new())
    }

    fn start_request(session_id: &str) -> SessionStartRequest {
        SessionStartRequest {
            execution_id: "e1".into(),
            session_id: session_id.into(),
            viewport_w: 1280,
            viewport_h: 720,
            headless: true,
            url: None,
        }
    }

    #[tokio::test]
    async fn test_start_action_end_flow() {
        let handler = handler();

        handler
            .handle_session_start(&start_request("s1"))
            .await
            .unwrap();

        let result = handler
            .handle_action(&ActionRequest {
                execution_id: "e1".into(),
                session_id: "s1".into(),
                action: "click".into(),
                params: json!({"x": 10, "y": 20}),
            })
            .await;

        assert!(result.success);
        assert!(result.screenshot.is_some());
        assert!(result.error.is_none());

        handler
            .handle_session_end(&SessionEndRequest {
                execution_id: "e1".into(),
                session_id: "s1".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_action_on_missing_session_is_result_level() {
        let handler = handler();

        let result = handler
            .handle_action(&ActionRequest {
                execution_id: "e1".into(),
                session_id: "ghost".into(),
                action: "screenshot".into(),
                params: json!({}),
            })
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
        assert!(result.screenshot.is_none());
    }

    #[tokio::test]
    async fn test_blocked_action_url_is_result_level() {
        let handler = handler();
        handler
            .handle_session_start(&start_request("s1"))
            .await
            .unwrap();

        let result = handler
            .handle_action(&ActionRequest {
                execution_id: "e1".into(),
                session_id: "s1".into(),
                action: "navigate".into(),
                params: json!({"url": "file:///etc/passwd"}),
            })
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("URL blocked"));
    }

    #[tokio::test]
    async fn test_blocked_session_entry_url_rejected_up_front() {
        let handler = handler();

        let mut request = start_request("s1");
        request.url = Some("ftp://example.com/".into());

        let err = handler.handle_session_start(&request).await.unwrap_err();
        assert!(matches!(err, HandlerError::UrlRejected(_)));
    }

    #[tokio::test]
    async fn test_duplicate_session_start() {
        let handler = handler();

        handler
            .handle_session_start(&start_request("s1"))
            .await
            .unwrap();
        let err = handler
            .handle_session_start(&start_request("s1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Session(SessionError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_and_drain_results() {
        let handler = handler();
        handler
            .handle_session_start(&start_request("s1"))
            .await
            .unwrap();

        let result = handler
            .handle_action(&ActionRequest {
                execution_id: "e1".into(),
                session_id: "s1".into(),
                action: "screenshot".into(),
                params: json!({}),
            })
            .await;

        assert!(handler.queue_result(result.clone()));
        assert!(handler.queue_result(result));
        assert_eq!(handler.pending_count("s1"), 2);

        let drained = handler.drain_pending("s1");
        assert_eq!(drained.len(), 2);
        assert_eq!(handler.pending_count("s1"), 0);
        assert!(handler.drain_pending("s1").is_empty());
    }

    #[tokio::test]
    async fn test_end_unknown_session() {
        let handler = handler();

        let err = handler
            .handle_session_end(&SessionEndRequest {
                execution_id: "e1".into(),
                session_id: "ghost".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Session(SessionError::NotFound(_))
        ));
    }
}
