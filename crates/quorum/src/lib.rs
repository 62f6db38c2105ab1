//! Quorum core: session/connection resilience and sandboxed execution.
//!
//! Mediates many concurrent end-user sessions to a remote, stateful
//! agent service over the ACP request/response protocol on persistent
//! WebSocket connections. The pieces, leaves first:
//!
//! - [`breaker`]: circuit breaker isolating the remote dependency
//! - [`acp::client`]: protocol client with request/response correlation
//! - [`acp::pool`]: per-user connection pool with message batching
//! - [`session::orchestrator`]: user identity -> live session binding,
//!   retries, streamed delivery, idle reaping
//! - [`sandbox`]: per-user container sandbox for shell commands
//!
//! Control flow: caller -> orchestrator -> (breaker gate) -> pool ->
//! client -> remote agent; responses stream back to the caller in
//! chunks. Shell-prefixed input goes straight to the sandbox instead.
//!
//! A failing remote, a single user's connection churn, or a runaway
//! command must not cascade: every network call is bounded, pending
//! requests are rejected promptly on connection loss, the breaker fails
//! fast while the remote is unhealthy, and commands run in
//! resource-limited containers rather than on the host.

pub mod acp;
pub mod breaker;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod session;

pub use acp::{AcpClient, AcpClientConfig, AgentPool, ConnectionState, PoolConfig};
pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitState};
pub use config::Config;
pub use error::{AcpError, OrchestratorError, SandboxError};
pub use sandbox::{SandboxConfig, SandboxManager};
pub use session::{MessageStream, SessionConfig, SessionOrchestrator};
