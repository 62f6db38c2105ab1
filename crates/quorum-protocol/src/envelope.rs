//! Request and response envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::payload::RequestPayload;
use crate::{now_ms, request_id};

/// The `type` value of a batch frame.
pub const BATCH_TYPE: &str = "batch";

/// An outbound request envelope.
///
/// `type` and `payload` are flattened from [`RequestPayload`], so the
/// serialized form is `{ id, type, payload, timestamp, correlationId? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per outstanding request; the correlation key.
    pub id: String,

    #[serde(flatten)]
    pub payload: RequestPayload,

    /// Unix milliseconds at send time.
    pub timestamp: i64,

    /// Links this request to a caller-scoped operation (e.g. one
    /// streamed chat turn). Not used for correlation; `id` is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Wrap a payload in a fresh envelope with a generated id.
    pub fn new(payload: RequestPayload) -> Self {
        Self {
            id: request_id(),
            payload,
            timestamp: now_ms(),
            correlation_id: None,
        }
    }

    /// Attach a correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// An inbound response envelope.
///
/// `id` echoes the request id. `success` selects which of `data` /
/// `error` is meaningful; a response never carries both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: String,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    pub timestamp: i64,
}

/// Error details for a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// A batch frame coalescing several requests into one transmission.
///
/// Note the member list lives under `data`, not `payload`; the batch
/// frame predates the tagged payload union and keeps its original
/// shape for remote compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub data: BatchData,

    pub timestamp: i64,
}

/// Payload of a batch frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchData {
    pub messages: Vec<Envelope>,
}

impl BatchEnvelope {
    /// Wrap a set of envelopes in a batch frame.
    pub fn new(messages: Vec<Envelope>) -> Self {
        Self {
            id: request_id(),
            kind: BATCH_TYPE.to_string(),
            data: BatchData { messages },
            timestamp: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_type_and_payload_fields() {
        let envelope = Envelope::new(RequestPayload::ChatSend {
            session_id: "s-1".to_string(),
            content: "hello".to_string(),
            streaming: true,
        });

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "chat.send");
        assert_eq!(value["payload"]["sessionId"], "s-1");
        assert_eq!(value["payload"]["content"], "hello");
        assert!(value["timestamp"].is_i64());
        // correlationId is omitted when unset
        assert!(value.get("correlationId").is_none());
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = Envelope::new(RequestPayload::SessionDestroy {
            session_id: "s-9".to_string(),
        })
        .with_correlation("turn-1");

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, envelope.id);
        assert_eq!(parsed.correlation_id.as_deref(), Some("turn-1"));
        match parsed.payload {
            RequestPayload::SessionDestroy { session_id } => assert_eq!(session_id, "s-9"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn batch_envelope_uses_data_field() {
        let batch = BatchEnvelope::new(vec![
            Envelope::new(RequestPayload::HealthCheck {}),
            Envelope::new(RequestPayload::HealthCheck {}),
        ]);

        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["type"], "batch");
        assert_eq!(value["data"]["messages"].as_array().unwrap().len(), 2);
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn failed_response_parses_error_detail() {
        let json = r#"{
            "id": "abc",
            "success": false,
            "error": { "code": "INVALID_SESSION", "message": "no such session" },
            "timestamp": 1700000000000
        }"#;

        let response: Response = serde_json::from_str(json).unwrap();
        assert!(!response.success);
        assert!(response.data.is_none());
        let error = response.error.unwrap();
        assert_eq!(error.code, "INVALID_SESSION");
        assert_eq!(error.message, "no such session");
    }

    #[test]
    fn response_tolerates_unknown_fields() {
        // The remote agent may add fields (e.g. duration); parsing must
        // not reject them.
        let json = r#"{
            "id": "abc",
            "success": true,
            "data": { "content": "hi" },
            "timestamp": 1700000000000,
            "duration": 12
        }"#;

        let response: Response = serde_json::from_str(json).unwrap();
        assert!(response.success);
        assert_eq!(response.data.unwrap()["content"], "hi");
    }
}
