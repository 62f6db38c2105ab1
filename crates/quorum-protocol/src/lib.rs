//! ACP wire types.
//!
//! The agent communication protocol (ACP) is an asynchronous
//! request/response convention layered on a persistent duplex
//! connection. Every request carries a unique `id`; the matching
//! response echoes it back. Several requests may be coalesced into a
//! single `batch` frame.
//!
//! This crate defines the envelope shapes and the closed set of request
//! payloads the core sends. Response `data` is deliberately schemaless
//! on the wire (the remote agent may add fields); typed views decode
//! the kinds the core consumes.

mod envelope;
mod payload;

pub use envelope::{BatchData, BatchEnvelope, Envelope, ErrorDetail, Response, BATCH_TYPE};
pub use payload::{
    ChatReply, HealthOk, RequestPayload, SessionCreated, SessionStats, TokenUsage,
    ToolCallRequest, ToolCallResult, UserCredentials,
};

/// Error codes carried in [`ErrorDetail::code`].
pub mod codes {
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    pub const TIMEOUT_ERROR: &str = "TIMEOUT_ERROR";
    pub const OPERATION_FAILED: &str = "OPERATION_FAILED";
    pub const INVALID_SESSION: &str = "INVALID_SESSION";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
}

/// Current wall-clock time as Unix milliseconds, the timestamp unit
/// used everywhere on the wire.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a fresh request id.
///
/// Ids must be unique per outstanding request on a connection; nanoid's
/// 21-char alphabet makes collisions a non-concern at our scale.
pub fn request_id() -> String {
    nanoid::nanoid!()
}
