//! Core error taxonomy.
//!
//! Each layer has its own error enum so callers can match on failure
//! kind without string inspection. Transport-level errors are recovered
//! locally up to the configured retry budgets; once a budget is
//! exhausted the error surfaces unchanged in kind, annotated with the
//! attempt count.

use std::time::Duration;

use thiserror::Error;

/// Result type for protocol client and pool operations.
pub type AcpResult<T> = Result<T, AcpError>;

/// Errors from the protocol client and connection pool.
///
/// Clone is required because a failed batch flush rejects every waiter
/// in the batch with the same underlying error.
#[derive(Debug, Clone, Error)]
pub enum AcpError {
    /// The transport failed to open or the handshake was rejected.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The connection dropped while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// No matching response arrived within the deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote agent answered with a failure response.
    #[error("remote error ({code}): {message}")]
    Remote { code: String, message: String },

    /// An inbound frame could not be parsed as a response.
    #[error("failed to parse inbound frame: {0}")]
    Parse(String),

    /// No pooled connection became available within the acquire window.
    #[error("no pooled connection became available within {0:?}")]
    PoolExhausted(Duration),

    /// Reconnection gave up after the configured attempt budget.
    #[error("reconnect failed after {attempts} attempts: {message}")]
    ReconnectFailed { attempts: u32, message: String },

    /// A response arrived but its data did not decode to the expected shape.
    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(String),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors from the container sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The container runtime command failed.
    #[error("sandbox {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    NotFound(String),

    /// No container runtime available.
    #[error("no container runtime available (docker or podman)")]
    NoRuntime,

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Execution was cancelled by the caller.
    #[error("execution cancelled")]
    Cancelled,

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the session orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Operation referenced an unknown user or session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session creation exhausted its retry budget.
    #[error("session creation failed after {attempts} attempts: {source}")]
    SessionCreate {
        attempts: u32,
        #[source]
        source: AcpError,
    },

    /// The remote agent is currently isolated by the circuit breaker.
    /// Never retried automatically; the caller must retry later.
    #[error("remote agent unavailable: circuit breaker is open")]
    CircuitOpen,

    /// A protocol-level failure.
    #[error(transparent)]
    Agent(#[from] AcpError),

    /// A sandbox failure. Always surfaced; never silently downgraded to
    /// host execution.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Malformed caller input.
    #[error("invalid request: {0}")]
    Validation(String),
}
