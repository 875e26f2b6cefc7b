//! Recording backend double
//!
//! Stands in for a real browser in tests and pool-less deployments. Records
//! every call so assertions can check exactly what was dispatched.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::backend::{BackendError, BackendResult, BrowserBackend, ScrollDirection};

/// In-memory backend that records calls instead of driving a browser
#[derive(Default)]
pub struct MockBackend {
    active: AtomicBool,
    screenshot_calls: AtomicUsize,
    clicks: Mutex<Vec<(i64, i64)>>,
    typed: Mutex<Vec<String>>,
    scrolls: Mutex<Vec<(ScrollDirection, i64)>>,
    navigations: Mutex<Vec<String>>,
    screenshot_response: Mutex<Vec<u8>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            screenshot_response: Mutex::new(b"fake-png-bytes".to_vec()),
            ..Self::default()
        }
    }

    /// Start already connected, as most tests want.
    pub fn active() -> Self {
        let mock = Self::new();
        mock.active.store(true, Ordering::SeqCst);
        mock
    }

    /// Replace the bytes returned by `screenshot`.
    pub fn set_screenshot_response(&self, bytes: Vec<u8>) {
        *self.screenshot_response.lock() = bytes;
    }

    pub fn screenshot_calls(&self) -> usize {
        self.screenshot_calls.load(Ordering::SeqCst)
    }

    pub fn clicks(&self) -> Vec<(i64, i64)> {
        self.clicks.lock().clone()
    }

    pub fn typed(&self) -> Vec<String> {
        self.typed.lock().clone()
    }

    pub fn scrolls(&self) -> Vec<(ScrollDirection, i64)> {
        self.scrolls.lock().clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().clone()
    }

    fn require_active(&self) -> BackendResult<()> {
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::NotActive)
        }
    }
}

#[async_trait]
impl BrowserBackend for MockBackend {
    async fn launch(&self, _ctx: &CancellationToken) -> BackendResult<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(BackendError::AlreadyLaunched);
        }
        Ok(())
    }

    async fn close(&self) -> BackendResult<()> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn screenshot(&self) -> BackendResult<Vec<u8>> {
        self.require_active()?;
        self.screenshot_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.screenshot_response.lock().clone())
    }

    async fn navigate(&self, url: &str) -> BackendResult<()> {
        self.require_active()?;
        self.navigations.lock().push(url.to_string());
        Ok(())
    }

    async fn click(&self, x: i64, y: i64) -> BackendResult<()> {
        self.require_active()?;
        self.clicks.lock().push((x, y));
        Ok(())
    }

    async fn type_text(&self, text: &str) -> BackendResult<()> {
        self.require_active()?;
        self.typed.lock().push(text.to_string());
        Ok(())
    }

    async fn scroll(&self, direction: ScrollDirection, amount: i64) -> BackendResult<()> {
        self.require_active()?;
        self.scrolls.lock().push((direction, amount));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_is_idempotent_even_unlaunched() {
        let mock = MockBackend::new();

        assert!(mock.close().await.is_ok());
        assert!(mock.close().await.is_ok());
        assert!(!mock.is_active().await);
    }

    #[tokio::test]
    async fn test_double_launch_is_an_error() {
        let mock = MockBackend::new();
        let ctx = CancellationToken::new();

        mock.launch(&ctx).await.unwrap();
        assert!(matches!(
            mock.launch(&ctx).await,
            Err(BackendError::AlreadyLaunched)
        ));
    }

    #[tokio::test]
    async fn test_actions_require_active() {
        let mock = MockBackend::new();

        assert!(matches!(
            mock.click(1, 2).await,
            Err(BackendError::NotActive)
        ));
        assert!(matches!(
            mock.screenshot().await,
            Err(BackendError::NotActive)
        ));
    }
}
