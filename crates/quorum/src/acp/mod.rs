//! Agent communication protocol (ACP) client layer.
//!
//! [`client::AcpClient`] owns one duplex connection to the remote agent
//! and correlates requests to responses. [`pool::AgentPool`] owns a
//! small pool of clients per user and coalesces outbound messages into
//! batches.

pub mod client;
pub mod pool;

pub use client::{AcpClient, AcpClientConfig, ConnectionState};
pub use pool::{AgentPool, PoolConfig};
