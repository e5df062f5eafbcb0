use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Session;
use crate::modules::Params;

/// Credentials attached to every control-plane call
#[derive(Debug, Clone)]
pub struct Identity {
    pub token: String,
    pub user_id: String,
    pub community_id: String,
}

impl From<&Session> for Identity {
    fn from(session: &Session) -> Self {
        Self {
            token: session.token.clone(),
            user_id: session.user_id.clone(),
            community_id: session.community_id.clone(),
        }
    }
}

/// A unit of work issued by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: String,

    #[serde(rename = "type", default)]
    pub kind: String,

    pub module_name: String,
    pub action: String,

    #[serde(default)]
    pub parameters: Params,

    #[serde(default)]
    pub user_id: String,

    #[serde(default)]
    pub community_id: String,

    #[serde(default)]
    pub priority: i32,

    /// Seconds; 0 means the configured default
    #[serde(default)]
    pub timeout: u64,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ActionRequest {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of one action, reported exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub id: String,
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Params>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Milliseconds
    pub duration: u64,

    pub completed_at: DateTime<Utc>,
}

impl ActionResponse {
    pub fn success(id: &str, result: Params, duration_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            success: true,
            result: Some(result),
            error: None,
            duration: duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(id: &str, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            success: false,
            result: None,
            error: Some(error.into()),
            duration: duration_ms,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub actions: Vec<ActionRequest>,

    #[serde(default)]
    pub next_poll: Option<DateTime<Utc>>,

    #[serde(default)]
    pub server_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub has_more: bool,

    #[serde(default)]
    pub poll_count: u64,

    #[serde(default)]
    pub client_info: Option<Value>,
}

/// Announcement sent once per run after the first successful poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub machine_id: String,
    pub agent_version: String,
    pub os: String,
    pub arch: String,
    pub hostname: Option<String>,
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub machine_id: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub poll_count: u64,
    pub actions_processed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_request_parses_snake_case_wire_format() {
        let raw = json!({
            "id": "a1",
            "type": "module_action",
            "module_name": "system",
            "action": "ping",
            "parameters": {"message": "hi"},
            "user_id": "u1",
            "community_id": "c1",
            "priority": 2,
            "timeout": 10,
            "created_at": "2026-01-01T00:00:00Z",
            "expires_at": "2026-01-01T00:05:00Z"
        });

        let action: ActionRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(action.kind, "module_action");
        assert_eq!(action.module_name, "system");
        assert_eq!(action.timeout, 10);
        assert_eq!(action.parameters.get("message"), Some(&json!("hi")));
    }

    #[test]
    fn action_request_defaults_optional_fields() {
        let raw = json!({
            "id": "a2",
            "module_name": "kv",
            "action": "list",
            "created_at": "2026-01-01T00:00:00Z",
            "expires_at": "2026-01-01T00:05:00Z"
        });

        let action: ActionRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(action.timeout, 0);
        assert!(action.parameters.is_empty());
    }

    #[test]
    fn expiry_is_inclusive_of_the_boundary() {
        let now = Utc::now();
        let action = ActionRequest {
            id: "a".to_string(),
            kind: String::new(),
            module_name: "m".to_string(),
            action: "x".to_string(),
            parameters: Params::new(),
            user_id: String::new(),
            community_id: String::new(),
            priority: 0,
            timeout: 0,
            created_at: now - chrono::Duration::seconds(10),
            expires_at: now,
        };

        assert!(action.is_expired_at(now));
        assert!(!action.is_expired_at(now - chrono::Duration::seconds(1)));
    }

    #[test]
    fn failure_response_omits_result() {
        let response = ActionResponse::failure("a1", "Action expired", 0);
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"], json!("Action expired"));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn poll_response_tolerates_sparse_body() {
        let response: PollResponse = serde_json::from_value(json!({"actions": []})).unwrap();
        assert!(!response.has_more);
        assert!(response.next_poll.is_none());
    }
}
