//! Typed request payloads and response views.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of requests this core sends to the remote agent.
///
/// Tagged by the envelope's `type` field with the body under `payload`.
/// Unknown inbound types are a parse error by design: the core never
/// accepts requests, only responses, so the union stays closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum RequestPayload {
    /// Create (or rebind) the remote session for a user.
    #[serde(rename = "session.create")]
    SessionCreate {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<UserCredentials>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_directory: Option<String>,
    },

    /// Tear down a remote session.
    #[serde(rename = "session.destroy")]
    SessionDestroy { session_id: String },

    /// Fetch activity/usage statistics for a session.
    #[serde(rename = "session.getStats")]
    SessionGetStats { session_id: String },

    /// Report token consumption for accounting.
    #[serde(rename = "session.updateTokens")]
    SessionUpdateTokens {
        session_id: String,
        input_tokens: u64,
        output_tokens: u64,
    },

    /// Send a chat message to the session's agent.
    #[serde(rename = "chat.send")]
    ChatSend {
        session_id: String,
        content: String,
        streaming: bool,
    },

    /// Execute a batch of tool calls remotely.
    #[serde(rename = "tools.execute")]
    ToolsExecute {
        session_id: String,
        calls: Vec<ToolCallRequest>,
    },

    /// Liveness probe.
    #[serde(rename = "health.check")]
    HealthCheck {},
}

impl RequestPayload {
    /// The wire `type` string for this payload.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SessionCreate { .. } => "session.create",
            Self::SessionDestroy { .. } => "session.destroy",
            Self::SessionGetStats { .. } => "session.getStats",
            Self::SessionUpdateTokens { .. } => "session.updateTokens",
            Self::ChatSend { .. } => "chat.send",
            Self::ToolsExecute { .. } => "tools.execute",
            Self::HealthCheck {} => "health.check",
        }
    }
}

/// Bearer credential forwarded at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCredentials {
    pub token: String,
}

/// One tool invocation inside a `tools.execute` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub id: String,
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub call_id: String,
    pub output: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Typed response views
// ============================================================================
//
// Response `data` is schemaless JSON; these views decode the kinds the
// core actually consumes. Unknown extra fields are tolerated.

/// `session.create` response data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: String,
}

/// `chat.send` response data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub content: String,
}

/// `session.getStats` response data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Unix milliseconds of the session's last interaction.
    pub last_activity: i64,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

/// Cumulative token counts for a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// `health.check` response data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthOk {
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_types_match_wire_names() {
        let payload = RequestPayload::SessionUpdateTokens {
            session_id: "s".to_string(),
            input_tokens: 10,
            output_tokens: 20,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], payload.type_name());
        assert_eq!(value["payload"]["inputTokens"], 10);
        assert_eq!(value["payload"]["outputTokens"], 20);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let json = r#"{ "type": "session.extend", "payload": {} }"#;
        assert!(serde_json::from_str::<RequestPayload>(json).is_err());
    }

    #[test]
    fn chat_reply_decodes_from_value() {
        let data = serde_json::json!({ "content": "hello", "model": "m-1" });
        let reply: ChatReply = serde_json::from_value(data).unwrap();
        assert_eq!(reply.content, "hello");
    }

    #[test]
    fn session_stats_defaults_missing_usage() {
        let data = serde_json::json!({ "lastActivity": 1700000000000i64 });
        let stats: SessionStats = serde_json::from_value(data).unwrap();
        assert_eq!(stats.token_usage.total_tokens, 0);
    }
}
