//! Action executor
//!
//! Dispatches controller verbs against a browser backend. Every successful
//! call returns a base64-encoded PNG taken after the action, so the
//! controller always receives fresh visual ground truth.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tracing::debug;

use super::policy::UrlPolicy;
use crate::browser::{BrowserBackend, ScrollDirection};

/// Hard cap on screenshot size before base64 encoding
pub const MAX_SCREENSHOT_BYTES: usize = 2 * 1024 * 1024;

/// Error type for action execution; all of these surface as result-level
/// failures, never transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("URL blocked: {0}")]
    UrlBlocked(String),

    #[error("Screenshot too large: {0} bytes")]
    ScreenshotTooLarge(usize),

    #[error("Browser is not active")]
    BrowserNotActive,

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Executor wrapping a backend and the URL policy with uniform verb dispatch
pub struct ActionExecutor {
    backend: Arc<dyn BrowserBackend>,
    policy: UrlPolicy,
}

impl ActionExecutor {
    pub fn new(backend: Arc<dyn BrowserBackend>, policy: UrlPolicy) -> Self {
        Self { backend, policy }
    }

    /// Execute a verb and return the post-action screenshot as base64.
    pub async fn execute(&self, action: &str, params: &Value) -> Result<String, ActionError> {
        if !self.backend.is_active().await {
            return Err(ActionError::BrowserNotActive);
        }

        match action {
            "screenshot" => {}
            "click" => {
                let x = number_param(params, "x")?;
                let y = number_param(params, "y")?;
                self.backend
                    .click(x, y)
                    .await
                    .map_err(|e| ActionError::Backend(e.to_string()))?;
            }
            "type" => {
                let text = string_param(params, "text")?;
                self.backend
                    .type_text(text)
                    .await
                    .map_err(|e| ActionError::Backend(e.to_string()))?;
            }
            "scroll" => {
                let direction = string_param(params, "direction")?;
                let direction = ScrollDirection::from_str(direction).ok_or_else(|| {
                    ActionError::InvalidParams(format!(
                        "scroll direction must be \"up\" or \"down\", got {:?}",
                        direction
                    ))
                })?;
                let amount = number_param(params, "amount")?;
                self.backend
                    .scroll(direction, amount)
                    .await
                    .map_err(|e| ActionError::Backend(e.to_string()))?;
            }
            "navigate" => {
                let url = string_param(params, "url")?;

                // Policy is consulted before the backend sees the URL.
                self.policy
                    .validate(url)
                    .map_err(|e| ActionError::UrlBlocked(e.to_string()))?;

                self.backend
                    .navigate(url)
                    .await
                    .map_err(|e| ActionError::Backend(e.to_string()))?;
            }
            other => return Err(ActionError::UnknownAction(other.to_string())),
        }

        self.capture().await
    }

    /// Take the post-action screenshot, enforce the size cap and encode it.
    async fn capture(&self) -> Result<String, ActionError> {
        let bytes = self
            .backend
            .screenshot()
            .await
            .map_err(|e| ActionError::Backend(e.to_string()))?;

        if bytes.len() > MAX_SCREENSHOT_BYTES {
            return Err(ActionError::ScreenshotTooLarge(bytes.len()));
        }

        debug!("Captured {} byte screenshot", bytes.len());
        Ok(BASE64.encode(bytes))
    }
}

fn number_param(params: &Value, key: &str) -> Result<i64, ActionError> {
    let value = params
        .get(key)
        .ok_or_else(|| ActionError::InvalidParams(format!("missing numeric field {:?}", key)))?;

    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or_else(|| ActionError::InvalidParams(format!("field {:?} must be a number", key)))
}

fn string_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, ActionError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::InvalidParams(format!("field {:?} must be a string", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MockBackend;
    use serde_json::json;

    fn executor_with(mock: Arc<MockBackend>) -> ActionExecutor {
        ActionExecutor::new(mock, UrlPolicy::new())
    }

    #[tokio::test]
    async fn test_click_returns_post_action_screenshot() {
        let mock = Arc::new(MockBackend::active());
        let executor = executor_with(mock.clone());

        let result = executor
            .execute("click", &json!({"x": 150, "y": 250}))
            .await
            .unwrap();

        assert!(!result.is_empty());
        let decoded = BASE64.decode(&result).unwrap();
        assert!(decoded.len() <= MAX_SCREENSHOT_BYTES);

        assert_eq!(mock.clicks(), vec![(150, 250)]);
        assert_eq!(mock.screenshot_calls(), 1);
    }

    #[tokio::test]
    async fn test_screenshot_verb() {
        let mock = Arc::new(MockBackend::active());
        let executor = executor_with(mock.clone());

        executor.execute("screenshot", &json!({})).await.unwrap();
        assert_eq!(mock.screenshot_calls(), 1);
    }

    #[tokio::test]
    async fn test_blocked_url_never_reaches_backend() {
        let mock = Arc::new(MockBackend::active());
        let executor = executor_with(mock.clone());

        let err = executor
            .execute("navigate", &json!({"url": "file:///etc/passwd"}))
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::UrlBlocked(_)));
        assert!(mock.navigations().is_empty());
        assert_eq!(mock.screenshot_calls(), 0);
    }

    #[tokio::test]
    async fn test_navigate_allowed_url() {
        let mock = Arc::new(MockBackend::active());
        let executor = executor_with(mock.clone());

        executor
            .execute("navigate", &json!({"url": "https://example.com/"}))
            .await
            .unwrap();

        assert_eq!(mock.navigations(), vec!["https://example.com/"]);
    }

    #[tokio::test]
    async fn test_scroll_directions() {
        let mock = Arc::new(MockBackend::active());
        let executor = executor_with(mock.clone());

        executor
            .execute("scroll", &json!({"direction": "down", "amount": 300}))
            .await
            .unwrap();
        executor
            .execute("scroll", &json!({"direction": "up", "amount": 100}))
            .await
            .unwrap();

        assert_eq!(
            mock.scrolls(),
            vec![(ScrollDirection::Down, 300), (ScrollDirection::Up, 100)]
        );

        let err = executor
            .execute("scroll", &json!({"direction": "sideways", "amount": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_missing_and_mistyped_params() {
        let mock = Arc::new(MockBackend::active());
        let executor = executor_with(mock.clone());

        let err = executor.execute("click", &json!({"x": 1})).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));

        let err = executor
            .execute("type", &json!({"text": 42}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));

        let err = executor
            .execute("click", &json!({"x": "left", "y": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));

        assert!(mock.clicks().is_empty());
        assert!(mock.typed().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let mock = Arc::new(MockBackend::active());
        let executor = executor_with(mock);

        let err = executor.execute("hover", &json!({})).await.unwrap_err();
        assert!(matches!(err, ActionError::UnknownAction(_)));
    }

    #[tokio::test]
    async fn test_inactive_backend_short_circuits() {
        let mock = Arc::new(MockBackend::new());
        let executor = executor_with(mock.clone());

        let err = executor
            .execute("click", &json!({"x": 1, "y": 2}))
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::BrowserNotActive));
        assert!(mock.clicks().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_screenshot_rejected() {
        let mock = Arc::new(MockBackend::active());
        mock.set_screenshot_response(vec![0u8; MAX_SCREENSHOT_BYTES + 1]);
        let executor = executor_with(mock);

        let err = executor.execute("screenshot", &json!({})).await.unwrap_err();
        assert!(matches!(err, ActionError::ScreenshotTooLarge(_)));
    }
}
