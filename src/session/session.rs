//! Session state

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::browser::BrowserBackend;

/// Lifecycle of a session. There is no recovery from `Closed`; a fresh id
/// must be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Launching,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::New,
            1 => SessionState::Launching,
            2 => SessionState::Active,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::New => write!(f, "new"),
            SessionState::Launching => write!(f, "launching"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Result payload queued while the controller transport is away
#[derive(Debug, Clone)]
pub struct PendingResult {
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// A logical browser automation context
pub struct Session {
    pub session_id: String,
    pub execution_id: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub headless: bool,
    pub initial_url: Option<String>,
    pub created_at: DateTime<Utc>,

    state: AtomicU8,
    last_active: Mutex<DateTime<Utc>>,
    container_id: Mutex<Option<String>>,
    backend: Arc<dyn BrowserBackend>,
    pending: Mutex<Vec<PendingResult>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        session_id: String,
        execution_id: String,
        viewport_width: u32,
        viewport_height: u32,
        headless: bool,
        initial_url: Option<String>,
        container_id: Option<String>,
        backend: Arc<dyn BrowserBackend>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            execution_id,
            viewport_width,
            viewport_height,
            headless,
            initial_url,
            created_at: now,
            state: AtomicU8::new(SessionState::New as u8),
            last_active: Mutex::new(now),
            container_id: Mutex::new(container_id),
            backend,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Update the activity timestamp. Never moves backwards.
    pub fn touch(&self) {
        let mut last = self.last_active.lock();
        let now = Utc::now();
        if now > *last {
            *last = now;
        }
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        *self.last_active.lock()
    }

    pub fn container_id(&self) -> Option<String> {
        self.container_id.lock().clone()
    }

    pub fn set_container_id(&self, id: Option<String>) {
        *self.container_id.lock() = id;
    }

    pub fn backend(&self) -> Arc<dyn BrowserBackend> {
        self.backend.clone()
    }

    /// Queue a result payload for delivery once the transport returns.
    pub fn queue_result(&self, payload: Value) {
        self.pending.lock().push(PendingResult {
            payload,
            created_at: Utc::now(),
        });
    }

    /// Take all pending results, leaving the queue empty, in one critical
    /// section.
    pub fn drain_pending(&self) -> Vec<PendingResult> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
