//! Request and result payload types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Requests the controller transport can submit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    SessionStart(SessionStartRequest),
    Action(ActionRequest),
    SessionEnd(SessionEndRequest),
}

/// Open a new browser session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartRequest {
    pub execution_id: String,
    pub session_id: String,
    pub viewport_w: i32,
    pub viewport_h: i32,
    pub headless: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Execute a UI action in an existing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub execution_id: String,
    pub session_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

/// Close a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndRequest {
    pub execution_id: String,
    pub session_id: String,
}

/// Outcome of an action, shipped back to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub execution_id: String,
    pub session_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let raw = json!({
            "type": "action",
            "execution_id": "e1",
            "session_id": "s1",
            "action": "click",
            "params": {"x": 1, "y": 2}
        });

        let request: BridgeRequest = serde_json::from_value(raw).unwrap();
        match request {
            BridgeRequest::Action(action) => {
                assert_eq!(action.action, "click");
                assert_eq!(action.params["x"], 1);
            }
            other => panic!("Unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_session_start_url_optional() {
        let raw = json!({
            "type": "session_start",
            "execution_id": "e1",
            "session_id": "s1",
            "viewport_w": 1280,
            "viewport_h": 720,
            "headless": true
        });

        let request: BridgeRequest = serde_json::from_value(raw).unwrap();
        match request {
            BridgeRequest::SessionStart(start) => assert!(start.url.is_none()),
            other => panic!("Unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_result_omits_empty_fields() {
        let result = ActionResult {
            execution_id: "e1".into(),
            session_id: "s1".into(),
            success: true,
            error: None,
            screenshot: Some("aGk=".into()),
            duration_ms: 12,
            container_id: None,
        };

        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("error").is_none());
        assert!(value.get("container_id").is_none());
        assert_eq!(value["screenshot"], "aGk=");
    }
}
