//! Per-user connection pool with outbound message batching.
//!
//! Amortizes per-message overhead and provides basic load distribution
//! across a small set of protocol clients per user. Outbound messages
//! accumulate in a per-user buffer that flushes when it reaches the
//! batch size or after a bounded delay since the first buffered
//! message, whichever comes first.
//!
//! Waiting for a pooled connection is a notify-based wait queue with a
//! maximum acquire timeout, woken when a member is added, a write slot
//! drains, or a member is removed. There is no polling loop.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

use quorum_protocol::{Envelope, HealthOk, RequestPayload};

use crate::acp::client::{AcpClient, AcpClientConfig, ConnectionState, Waiter};
use crate::error::{AcpError, AcpResult};

/// Capabilities advertised in every connection handshake.
const CAPABILITIES: &[&str] = &["session.create", "chat.send", "tools.execute"];

/// Pool and batching configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live connections per user.
    pub max_pool_size: usize,
    /// Buffered messages that force a flush.
    pub batch_size: usize,
    /// Maximum time a message waits in the buffer.
    pub batch_delay: Duration,
    /// Maximum wait for a pooled connection before failing the caller.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 5,
            batch_size: 10,
            batch_delay: Duration::from_millis(100),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct PoolEntry {
    clients: Vec<AcpClient>,
    /// Reserved slots for connections currently being established, so
    /// concurrent acquirers cannot overshoot the pool cap.
    creating: usize,
}

#[derive(Default)]
struct BatchBuffer {
    entries: Vec<(Envelope, Waiter)>,
    /// Delay-flush timer armed by the first buffered message. Stray
    /// timers that fire after a size-triggered flush find an empty
    /// buffer and are no-ops, so they are never aborted.
    timer: Option<JoinHandle<()>>,
}

struct PoolInner {
    config: PoolConfig,
    client_config: AcpClientConfig,
    pools: DashMap<String, PoolEntry>,
    buffers: DashMap<String, BatchBuffer>,
    released: Arc<Notify>,
}

enum Acquire {
    Ready(AcpClient),
    Create,
    Wait,
}

/// Connection pool and batching client for the remote agent.
///
/// Cheap to clone; all clones share the same pools and buffers.
#[derive(Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

impl AgentPool {
    pub fn new(config: PoolConfig, client_config: AcpClientConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                client_config,
                pools: DashMap::new(),
                buffers: DashMap::new(),
                released: Arc::new(Notify::new()),
            }),
        }
    }

    /// Get an open, non-backpressured connection for the user.
    ///
    /// Creates a new client if the pool has capacity; otherwise waits on
    /// the release queue up to the acquire timeout.
    pub async fn get_connection(&self, user_id: &str) -> AcpResult<AcpClient> {
        let deadline = tokio::time::Instant::now() + self.inner.config.acquire_timeout;
        loop {
            // Arm the wakeup before inspecting the pool so a release
            // between the check and the wait cannot be missed.
            let notified = self.inner.released.notified();
            tokio::pin!(notified);

            // Check-and-reserve is synchronous; no await while the
            // entry guard is held.
            let action = {
                let mut entry = self.inner.pools.entry(user_id.to_string()).or_default();
                entry
                    .clients
                    .retain(|c| c.state() != ConnectionState::Error);

                if let Some(client) = entry.clients.iter().find(|c| c.available()) {
                    Acquire::Ready(client.clone())
                } else if entry.clients.len() + entry.creating < self.inner.config.max_pool_size {
                    entry.creating += 1;
                    Acquire::Create
                } else {
                    Acquire::Wait
                }
            };

            match action {
                Acquire::Ready(client) => return Ok(client),
                Acquire::Create => return self.create_connection(user_id).await,
                Acquire::Wait => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(AcpError::PoolExhausted(self.inner.config.acquire_timeout));
                        }
                    }
                }
            }
        }
    }

    async fn create_connection(&self, user_id: &str) -> AcpResult<AcpClient> {
        let client = AcpClient::with_listener(
            self.inner.client_config.clone(),
            Some(self.inner.released.clone()),
        );
        let result = client.connect(CAPABILITIES).await;

        let mut entry = self.inner.pools.entry(user_id.to_string()).or_default();
        entry.creating = entry.creating.saturating_sub(1);
        match result {
            Ok(()) => {
                entry.clients.push(client.clone());
                drop(entry);
                info!("created pooled connection for user {user_id}");
                self.inner.released.notify_waiters();
                Ok(client)
            }
            Err(err) => {
                let now_empty = entry.clients.is_empty() && entry.creating == 0;
                drop(entry);
                // An empty pool is removed from the table entirely.
                if now_empty {
                    self.inner
                        .pools
                        .remove_if(user_id, |_, e| e.clients.is_empty() && e.creating == 0);
                }
                // Free the reserved slot for other waiters.
                self.inner.released.notify_waiters();
                Err(err)
            }
        }
    }

    /// Send a request through the user's batching buffer and await the
    /// matching response.
    pub async fn request(&self, user_id: &str, payload: RequestPayload) -> AcpResult<Value> {
        self.enqueue(user_id, Envelope::new(payload)).await
    }

    /// Same as [`request`](Self::request) with a correlation id linking
    /// the request to a caller-scoped operation.
    pub async fn request_with_correlation(
        &self,
        user_id: &str,
        payload: RequestPayload,
        correlation_id: &str,
    ) -> AcpResult<Value> {
        let envelope = Envelope::new(payload).with_correlation(correlation_id);
        self.enqueue(user_id, envelope).await
    }

    async fn enqueue(&self, user_id: &str, envelope: Envelope) -> AcpResult<Value> {
        let (tx, rx) = oneshot::channel();

        // The full batch is drained inside the same critical section
        // that detects the size threshold, so a size-triggered flush
        // carries exactly `batch_size` messages even under concurrent
        // enqueues.
        let full_batch = {
            let mut buffer = self.inner.buffers.entry(user_id.to_string()).or_default();
            buffer.entries.push((envelope, tx));

            if buffer.entries.len() >= self.inner.config.batch_size {
                buffer.timer = None;
                Some(std::mem::take(&mut buffer.entries))
            } else {
                if buffer.timer.is_none() {
                    let pool = self.clone();
                    let user = user_id.to_string();
                    let delay = self.inner.config.batch_delay;
                    buffer.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        pool.flush_user(&user).await;
                    }));
                }
                None
            }
        };

        if let Some(entries) = full_batch {
            self.flush_entries(user_id, entries).await;
        }

        rx.await.map_err(|_| AcpError::ConnectionLost)?
    }

    /// Delay-timer flush: drain whatever is buffered and send it.
    async fn flush_user(&self, user_id: &str) {
        let entries = {
            let Some(mut buffer) = self.inner.buffers.get_mut(user_id) else {
                return;
            };
            buffer.timer = None;
            std::mem::take(&mut buffer.entries)
        };
        if entries.is_empty() {
            return;
        }
        self.flush_entries(user_id, entries).await;
    }

    /// Send a drained batch: one message goes out plain, several are
    /// wrapped in a batch envelope. On failure every request in the
    /// flushed batch is rejected with the transport error.
    async fn flush_entries(&self, user_id: &str, entries: Vec<(Envelope, Waiter)>) {
        debug!("flushing {} message(s) for user {user_id}", entries.len());

        match self.get_connection(user_id).await {
            Ok(client) => {
                // The client rejects every registered waiter itself on
                // transmit failure.
                if let Err(err) = client.send_with_waiters(entries).await {
                    warn!("batch flush failed for user {user_id}: {err}");
                }
            }
            Err(err) => {
                warn!("no connection to flush batch for user {user_id}: {err}");
                for (_, waiter) in entries {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    /// Round-trip a `health.check` over a dedicated transient connection.
    pub async fn health_check(&self) -> AcpResult<HealthOk> {
        let client = AcpClient::new(self.inner.client_config.clone());
        client.connect(CAPABILITIES).await?;
        let result = client.request(RequestPayload::HealthCheck {}).await;
        client.disconnect().await;
        serde_json::from_value(result?).map_err(|e| AcpError::UnexpectedResponse(e.to_string()))
    }

    /// Close every connection for the user (logout) and reject anything
    /// still buffered.
    pub async fn disconnect_user(&self, user_id: &str) {
        if let Some((_, buffer)) = self.inner.buffers.remove(user_id) {
            for (_, waiter) in buffer.entries {
                let _ = waiter.send(Err(AcpError::ConnectionLost));
            }
        }
        if let Some((_, entry)) = self.inner.pools.remove(user_id) {
            for client in entry.clients {
                client.disconnect().await;
            }
            info!("closed all connections for user {user_id}");
        }
        self.inner.released.notify_waiters();
    }

    /// Close every connection for every user.
    pub async fn shutdown(&self) {
        let users: Vec<String> = self.inner.pools.iter().map(|e| e.key().clone()).collect();
        for user in users {
            self.disconnect_user(&user).await;
        }
    }

    /// Best connection state across the user's pool members.
    pub fn user_connection_state(&self, user_id: &str) -> Option<ConnectionState> {
        let entry = self.inner.pools.get(user_id)?;
        if entry.clients.iter().any(|c| c.is_connected()) {
            return Some(ConnectionState::Connected);
        }
        entry.clients.first().map(|c| c.state())
    }

    /// Number of live connections for a user.
    pub fn pool_size(&self, user_id: &str) -> usize {
        self.inner
            .pools
            .get(user_id)
            .map(|entry| entry.clients.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("users", &self.inner.pools.len())
            .field("max_pool_size", &self.inner.config.max_pool_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoint_fails_with_connection_error() {
        let client_config = AcpClientConfig {
            // Nothing listens on this port.
            endpoint: "ws://127.0.0.1:9".to_string(),
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let pool = AgentPool::new(PoolConfig::default(), client_config);

        let result = pool.get_connection("u1").await;
        assert!(matches!(result, Err(AcpError::Connection(_))));
        assert_eq!(pool.pool_size("u1"), 0);
    }
}
