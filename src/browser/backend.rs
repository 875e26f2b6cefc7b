//! Browser backend trait definitions

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Error type for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Browser is not active")]
    NotActive,

    #[error("Browser already launched")]
    AlreadyLaunched,

    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Driver error: {0}")]
    Driver(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Vertical scroll direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "up" => Some(ScrollDirection::Up),
            "down" => Some(ScrollDirection::Down),
            _ => None,
        }
    }

    /// Signed pixel delta for a scroll of `amount` pixels: up is negative,
    /// down is positive.
    pub fn delta(&self, amount: i64) -> i64 {
        match self {
            ScrollDirection::Up => -amount,
            ScrollDirection::Down => amount,
        }
    }
}

/// Creation parameters handed to a [`BackendFactory`]
#[derive(Debug, Clone)]
pub struct BackendSpec {
    /// Host port of the container's debug endpoint, when container-attached
    pub host_port: Option<u16>,

    /// Emulated viewport width
    pub viewport_width: u32,

    /// Emulated viewport height
    pub viewport_height: u32,

    /// Whether the browser runs headless
    pub headless: bool,
}

/// Factory producing a backend for a new session
pub type BackendFactory = Arc<dyn Fn(&BackendSpec) -> Arc<dyn BrowserBackend> + Send + Sync>;

/// Capability contract for driving a browser
///
/// Implementations serialize their driver commands internally; callers may
/// invoke methods from concurrent tasks.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Connect to the browser. Fails on a second call.
    async fn launch(&self, ctx: &CancellationToken) -> BackendResult<()>;

    /// Disconnect. Idempotent; safe on a never-launched instance.
    async fn close(&self) -> BackendResult<()>;

    /// Whether the backend is connected and usable
    async fn is_active(&self) -> bool;

    /// Capture a PNG screenshot of the current page
    async fn screenshot(&self) -> BackendResult<Vec<u8>>;

    /// Navigate to a URL
    async fn navigate(&self, url: &str) -> BackendResult<()>;

    /// Click at viewport coordinates
    async fn click(&self, x: i64, y: i64) -> BackendResult<()>;

    /// Type text into the focused element
    async fn type_text(&self, text: &str) -> BackendResult<()>;

    /// Scroll vertically by `amount` pixels in `direction`
    async fn scroll(&self, direction: ScrollDirection, amount: i64) -> BackendResult<()>;
}
