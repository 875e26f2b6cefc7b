//! Container-attached browser backend
//!
//! Connects to the sandbox container's remote-debugging endpoint with
//! chromiumoxide. The websocket URL is discovered from `/json/version` on
//! the container's mapped host port.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backend::{BackendError, BackendResult, BrowserBackend, ScrollDirection};

/// Delays between connect attempts
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Timeout for the websocket URL discovery request
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Live CDP connection state
struct Connection {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

/// Browser backend attached to a sandbox container
pub struct ChromiumBackend {
    host_port: u16,
    viewport_width: u32,
    viewport_height: u32,
    // Single lock serializing all driver commands for this instance.
    conn: Mutex<Option<Connection>>,
    http: reqwest::Client,
}

impl ChromiumBackend {
    pub fn new(host_port: u16, viewport_width: u32, viewport_height: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            host_port,
            viewport_width,
            viewport_height,
            conn: Mutex::new(None),
            http,
        }
    }

    /// Discover the websocket debugger URL from the container's version
    /// endpoint.
    async fn discover_ws_url(&self) -> BackendResult<String> {
        let url = format!("http://127.0.0.1:{}/json/version", self.host_port);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::LaunchFailed(e.to_string()))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::LaunchFailed(e.to_string()))?;

        body.get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                BackendError::LaunchFailed("version endpoint returned no debugger URL".to_string())
            })
    }

    /// One connection attempt: attach, spawn the event handler, verify the
    /// connection by opening a blank page.
    async fn try_connect(&self) -> BackendResult<Connection> {
        let ws_url = self.discover_ws_url().await?;

        let (browser, mut events) = Browser::connect(ws_url)
            .await
            .map_err(|e| BackendError::LaunchFailed(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler.abort();
                return Err(BackendError::LaunchFailed(e.to_string()));
            }
        };

        Ok(Connection {
            browser,
            page,
            handler,
        })
    }
}

#[async_trait]
impl BrowserBackend for ChromiumBackend {
    async fn launch(&self, ctx: &CancellationToken) -> BackendResult<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Err(BackendError::AlreadyLaunched);
        }

        let mut last_error = None;
        let mut connected = None;

        for attempt in 0..=RETRY_DELAYS.len() {
            match self.try_connect().await {
                Ok(connection) => {
                    connected = Some(connection);
                    break;
                }
                Err(e) => {
                    debug!(
                        "CDP connect attempt {} to port {} failed: {}",
                        attempt + 1,
                        self.host_port,
                        e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < RETRY_DELAYS.len() {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(BackendError::Cancelled),
                    _ = tokio::time::sleep(RETRY_DELAYS[attempt]) => {}
                }
            }
        }

        let connection = match connected {
            Some(c) => c,
            None => {
                return Err(last_error
                    .unwrap_or_else(|| BackendError::LaunchFailed("connect failed".to_string())))
            }
        };

        // Viewport emulation failure is not fatal.
        let metrics = SetDeviceMetricsOverrideParams::new(
            self.viewport_width as i64,
            self.viewport_height as i64,
            1.0,
            false,
        );
        if let Err(e) = connection.page.execute(metrics).await {
            warn!("Failed to emulate viewport: {}", e);
        }

        *conn = Some(connection);
        Ok(())
    }

    async fn close(&self) -> BackendResult<()> {
        let mut conn = self.conn.lock().await;

        if let Some(mut connection) = conn.take() {
            if let Err(e) = connection.browser.close().await {
                debug!("Browser close returned error: {}", e);
            }
            connection.handler.abort();
        }

        Ok(())
    }

    async fn is_active(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn screenshot(&self) -> BackendResult<Vec<u8>> {
        let conn = self.conn.lock().await;
        let connection = conn.as_ref().ok_or(BackendError::NotActive)?;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();

        connection
            .page
            .screenshot(params)
            .await
            .map_err(|e| BackendError::Driver(e.to_string()))
    }

    async fn navigate(&self, url: &str) -> BackendResult<()> {
        let conn = self.conn.lock().await;
        let connection = conn.as_ref().ok_or(BackendError::NotActive)?;

        connection
            .page
            .goto(url)
            .await
            .map_err(|e| BackendError::Driver(e.to_string()))?;
        Ok(())
    }

    async fn click(&self, x: i64, y: i64) -> BackendResult<()> {
        let conn = self.conn.lock().await;
        let connection = conn.as_ref().ok_or(BackendError::NotActive)?;

        let point = chromiumoxide::layout::Point::new(x as f64, y as f64);
        connection
            .page
            .click(point)
            .await
            .map_err(|e| BackendError::Driver(e.to_string()))?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> BackendResult<()> {
        let conn = self.conn.lock().await;
        let connection = conn.as_ref().ok_or(BackendError::NotActive)?;

        connection
            .page
            .type_str(text)
            .await
            .map_err(|e| BackendError::Driver(e.to_string()))?;
        Ok(())
    }

    async fn scroll(&self, direction: ScrollDirection, amount: i64) -> BackendResult<()> {
        let conn = self.conn.lock().await;
        let connection = conn.as_ref().ok_or(BackendError::NotActive)?;

        let delta = direction.delta(amount);
        connection
            .page
            .evaluate(format!("window.scrollBy(0, {})", delta))
            .await
            .map_err(|e| BackendError::Driver(e.to_string()))?;
        Ok(())
    }
}
