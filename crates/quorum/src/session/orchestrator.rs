//! Session orchestrator.
//!
//! Maps a user identity to exactly one logical session, creates
//! sessions through the connection pool with bounded retries, owns the
//! circuit breaker guarding all traffic to the remote agent, and
//! delivers replies as a chunk stream.
//!
//! Shell-prefixed input (`!cmd`) bypasses the protocol entirely and
//! runs in the user's sandbox container.
//!
//! Streaming note: the remote agent answers `chat.send` with a complete
//! reply; the orchestrator slices it into fixed-size chunks with a
//! small delay between slices. The stream contract (ordered chunks,
//! one terminal outcome) would carry true incremental streaming
//! unchanged if the remote ever provides it.

use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use log::{debug, info, warn};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use quorum_protocol::{
    ChatReply, HealthOk, RequestPayload, SessionCreated, SessionStats, UserCredentials,
};

use crate::acp::pool::AgentPool;
use crate::breaker::CircuitBreaker;
use crate::error::{AcpError, OrchestratorError};
use crate::sandbox::executor::ExecOutput;
use crate::sandbox::manager::SandboxManager;
use crate::session::models::{ExecutionSession, SessionInfo, UserSession};

/// Messages starting with this prefix run in the sandbox instead of
/// going to the remote agent.
pub const SHELL_ESCAPE_PREFIX: char = '!';

/// A finite, ordered stream of reply chunks. The stream ending is the
/// completion signal; an `Err` item is the terminal failure. The two
/// are mutually exclusive.
pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<String, OrchestratorError>> + Send>>;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session creation attempts before giving up.
    pub create_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_backoff_base: Duration,
    /// Idle age past which a session is torn down.
    pub session_max_age: Duration,
    /// Idle sweep interval.
    pub reap_interval: Duration,
    /// Reply slice size for simulated streaming (chars).
    pub stream_chunk_size: usize,
    /// Delay between reply slices.
    pub stream_chunk_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            create_retries: 3,
            retry_backoff_base: Duration::from_secs(1),
            session_max_age: Duration::from_secs(60 * 60),
            reap_interval: Duration::from_secs(60),
            stream_chunk_size: 50,
            stream_chunk_delay: Duration::from_millis(10),
        }
    }
}

struct OrchestratorInner {
    config: SessionConfig,
    pool: AgentPool,
    breaker: CircuitBreaker,
    sandboxes: SandboxManager,
    sessions: DashMap<String, UserSession>,
    /// Per-user creation locks: concurrent first requests must not
    /// create two remote sessions for one user.
    creating: DashMap<String, Arc<AsyncMutex<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// The single entry point for delivering messages to a user's session.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl SessionOrchestrator {
    /// Construct from explicitly built collaborators.
    pub fn new(
        config: SessionConfig,
        pool: AgentPool,
        breaker: CircuitBreaker,
        sandboxes: SandboxManager,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                pool,
                breaker,
                sandboxes,
                sessions: DashMap::new(),
                creating: DashMap::new(),
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Construct the full stack from one configuration.
    pub fn from_config(config: crate::config::Config) -> Self {
        let pool = AgentPool::new(config.pool, config.agent);
        let breaker = CircuitBreaker::new("remote-agent", config.breaker);
        let sandboxes = SandboxManager::new(config.sandbox);
        Self::new(config.session, pool, breaker, sandboxes)
    }

    /// Start background work (session reaper, sandbox idle sweep).
    pub fn start(&self) {
        self.spawn_reaper();
        self.inner.sandboxes.start_sweeper();
    }

    /// Tear down background tasks, sessions, connections, sandboxes.
    pub async fn shutdown(&self) {
        let handle = self.inner.reaper.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let users: Vec<String> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        for user in users {
            if let Err(err) = self.delete_user_session(&user).await {
                warn!("shutdown teardown failed for user {user}: {err}");
            }
        }
        self.inner.pool.shutdown().await;
        self.inner.sandboxes.shutdown().await;
    }

    /// Create the user's session, or return the existing one unchanged.
    ///
    /// Creation goes through the connection pool with bounded retries
    /// and exponential backoff; exhaustion surfaces the last underlying
    /// cause annotated with the attempt count.
    pub async fn create_user_session(
        &self,
        user_id: &str,
        credentials: Option<UserCredentials>,
        working_directory: Option<&Path>,
    ) -> Result<String, OrchestratorError> {
        if user_id.is_empty() {
            return Err(OrchestratorError::Validation(
                "user id cannot be empty".to_string(),
            ));
        }

        if let Some(session) = self.inner.sessions.get(user_id) {
            session.touch();
            return Ok(session.session_id.clone());
        }

        let lock = self
            .inner
            .creating
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have finished while we waited.
        if let Some(session) = self.inner.sessions.get(user_id) {
            session.touch();
            return Ok(session.session_id.clone());
        }

        let retries = self.inner.config.create_retries.max(1);
        let mut last_err = AcpError::ConnectionLost;
        let mut data = None;
        for attempt in 1..=retries {
            let payload = RequestPayload::SessionCreate {
                user_id: user_id.to_string(),
                credentials: credentials.clone(),
                working_directory: working_directory
                    .map(|p| p.to_string_lossy().to_string()),
            };
            match self.inner.pool.request(user_id, payload).await {
                Ok(value) => {
                    data = Some(value);
                    break;
                }
                Err(err) => {
                    warn!(
                        "session create attempt {attempt}/{retries} failed for user {user_id}: {err}"
                    );
                    last_err = err;
                    if attempt < retries {
                        let delay =
                            self.inner.config.retry_backoff_base * 2u32.pow(attempt - 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let Some(data) = data else {
            return Err(OrchestratorError::SessionCreate {
                attempts: retries,
                source: last_err,
            });
        };
        let created: SessionCreated = serde_json::from_value(data)
            .map_err(|e| AcpError::UnexpectedResponse(e.to_string()))?;

        self.inner.sessions.insert(
            user_id.to_string(),
            UserSession::new(created.session_id.clone()),
        );
        self.inner.creating.remove(user_id);
        info!(
            "created session {} for user {user_id}",
            created.session_id
        );
        Ok(created.session_id)
    }

    /// Deliver a message to the user's session and stream the reply.
    ///
    /// Shell-prefixed messages run in the sandbox; everything else is
    /// gated through the circuit breaker to the remote agent.
    pub async fn send_message_streaming(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<MessageStream, OrchestratorError> {
        let session = self
            .inner
            .sessions
            .get(user_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(user_id.to_string()))?;
        session.touch();
        drop(session);
        self.inner.sandboxes.touch(user_id);

        if let Some(rest) = message.strip_prefix(SHELL_ESCAPE_PREFIX) {
            let command = rest.trim().to_string();
            if command.is_empty() {
                return Err(OrchestratorError::Validation(
                    "empty shell command".to_string(),
                ));
            }
            return Ok(self.stream_shell(user_id, command));
        }

        Ok(self.stream_chat(user_id, session_id, message))
    }

    fn stream_shell(&self, user_id: &str, command: String) -> MessageStream {
        let (tx, rx) = mpsc::channel(16);
        let orchestrator = self.clone();
        let user = user_id.to_string();

        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let result = {
                let exec = async {
                    let sandbox = orchestrator
                        .inner
                        .sandboxes
                        .get_or_create(&user, None)
                        .await?;
                    Ok::<ExecOutput, OrchestratorError>(
                        sandbox.execute(&command, &cancel).await?,
                    )
                };
                tokio::pin!(exec);

                tokio::select! {
                    result = &mut exec => result,
                    // Caller dropped the stream: kill the command.
                    _ = tx.closed() => {
                        cancel.cancel();
                        return;
                    }
                }
            };

            match result {
                Ok(output) => {
                    let _ = tx.send(Ok(format_shell_block(&command, &output))).await;
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    fn stream_chat(&self, user_id: &str, session_id: &str, message: &str) -> MessageStream {
        let (tx, rx) = mpsc::channel(16);
        let orchestrator = self.clone();
        let user = user_id.to_string();
        let session = session_id.to_string();
        let content = message.to_string();

        tokio::spawn(async move {
            let correlation = quorum_protocol::request_id();
            let pool = orchestrator.inner.pool.clone();
            let result = orchestrator
                .inner
                .breaker
                .execute(|| {
                    let payload = RequestPayload::ChatSend {
                        session_id: session.clone(),
                        content: content.clone(),
                        streaming: true,
                    };
                    let pool = pool.clone();
                    let user = user.clone();
                    let correlation = correlation.clone();
                    async move {
                        pool.request_with_correlation(&user, payload, &correlation).await
                    }
                })
                .await;

            match result {
                Ok(data) => {
                    let reply: ChatReply = match serde_json::from_value(data) {
                        Ok(reply) => reply,
                        Err(err) => {
                            let _ = tx
                                .send(Err(OrchestratorError::Agent(
                                    AcpError::UnexpectedResponse(err.to_string()),
                                )))
                                .await;
                            return;
                        }
                    };

                    let chunks = chunk_content(
                        &reply.content,
                        orchestrator.inner.config.stream_chunk_size,
                    );
                    debug!(
                        "streaming {} chunk(s) to user {user} (correlation {correlation})",
                        chunks.len()
                    );
                    for chunk in chunks {
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Caller went away; stop producing.
                            return;
                        }
                        tokio::time::sleep(orchestrator.inner.config.stream_chunk_delay).await;
                    }
                    // Stream end is the completion signal.
                }
                Err(err) => {
                    let _ = tx.send(Err(err.into())).await;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    /// Tear down the user's session: best-effort remote destroy, then
    /// local connection and sandbox cleanup.
    pub async fn delete_user_session(&self, user_id: &str) -> Result<(), OrchestratorError> {
        let Some((_, session)) = self.inner.sessions.remove(user_id) else {
            return Err(OrchestratorError::SessionNotFound(user_id.to_string()));
        };

        let destroy = RequestPayload::SessionDestroy {
            session_id: session.session_id.clone(),
        };
        if let Err(err) = self.inner.pool.request(user_id, destroy).await {
            warn!(
                "failed to destroy remote session {} for user {user_id}: {err}",
                session.session_id
            );
        }

        self.inner.pool.disconnect_user(user_id).await;
        if let Err(err) = self.inner.sandboxes.stop(user_id).await {
            warn!("failed to stop sandbox for user {user_id}: {err}");
        }
        info!("deleted session {} for user {user_id}", session.session_id);
        Ok(())
    }

    /// Fetch remote statistics for the user's session.
    pub async fn get_session_stats(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<SessionStats, OrchestratorError> {
        self.require_session(user_id)?;
        let data = self
            .inner
            .pool
            .request(
                user_id,
                RequestPayload::SessionGetStats {
                    session_id: session_id.to_string(),
                },
            )
            .await?;
        Ok(serde_json::from_value(data)
            .map_err(|e| AcpError::UnexpectedResponse(e.to_string()))?)
    }

    /// Report token consumption for accounting.
    pub async fn update_token_usage(
        &self,
        user_id: &str,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), OrchestratorError> {
        self.require_session(user_id)?;
        self.inner
            .pool
            .request(
                user_id,
                RequestPayload::SessionUpdateTokens {
                    session_id: session_id.to_string(),
                    input_tokens,
                    output_tokens,
                },
            )
            .await?;
        Ok(())
    }

    /// The user's session id, if one is live.
    pub fn user_session_id(&self, user_id: &str) -> Option<String> {
        self.inner
            .sessions
            .get(user_id)
            .map(|s| s.session_id.clone())
    }

    /// Compat lookup by session id. O(n) over live sessions, acceptable
    /// at expected session-count scale.
    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner.sessions.iter().find_map(|entry| {
            if entry.session_id == session_id {
                Some(self.session_info(entry.key(), entry.value()))
            } else {
                None
            }
        })
    }

    /// All live sessions.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .iter()
            .map(|entry| self.session_info(entry.key(), entry.value()))
            .collect()
    }

    /// The user's sandbox binding, if a sandbox is live.
    pub fn execution_session(&self, user_id: &str) -> Option<ExecutionSession> {
        self.inner.sandboxes.get(user_id).map(|sandbox| ExecutionSession {
            user_id: user_id.to_string(),
            container_name: sandbox.container_name().to_string(),
            workspace_dir: sandbox.workspace_dir().to_string_lossy().to_string(),
            resource_limits: sandbox.limits().clone(),
        })
    }

    /// Round-trip a health check to the remote agent.
    pub async fn health(&self) -> Result<HealthOk, OrchestratorError> {
        Ok(self.inner.pool.health_check().await?)
    }

    /// Breaker state, exposed for introspection.
    pub fn breaker_state(&self) -> crate::breaker::CircuitState {
        self.inner.breaker.state()
    }

    fn require_session(&self, user_id: &str) -> Result<(), OrchestratorError> {
        let session = self
            .inner
            .sessions
            .get(user_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(user_id.to_string()))?;
        session.touch();
        Ok(())
    }

    fn session_info(&self, user_id: &str, session: &UserSession) -> SessionInfo {
        let connection_state = self
            .inner
            .pool
            .user_connection_state(user_id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "disconnected".to_string());
        SessionInfo {
            session_id: session.session_id.clone(),
            user_id: user_id.to_string(),
            connection_state,
            created_at: session.created_at,
            idle_ms: session.idle_for().as_millis() as u64,
        }
    }

    fn spawn_reaper(&self) {
        let orchestrator = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(orchestrator.inner.config.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                orchestrator.reap_idle().await;
            }
        });

        let mut reaper = self.inner.reaper.lock().unwrap();
        if let Some(old) = reaper.replace(handle) {
            old.abort();
        }
    }

    async fn reap_idle(&self) {
        let max_age = self.inner.config.session_max_age;
        let idle: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.idle_for() > max_age)
            .map(|entry| entry.key().clone())
            .collect();

        for user in idle {
            info!("reaping idle session for user {user}");
            if let Err(err) = self.delete_user_session(&user).await {
                warn!("failed to reap session for user {user}: {err}");
            }
        }
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

/// Format a sandbox execution as a fenced block followed by the exit
/// code, the shape chat clients render for shell escapes.
fn format_shell_block(command: &str, output: &ExecOutput) -> String {
    let mut block = format!("```bash\n$ {command}\n");
    if !output.stdout.is_empty() {
        block.push_str(&output.stdout);
        if !output.stdout.ends_with('\n') {
            block.push('\n');
        }
    }
    if !output.stderr.is_empty() {
        block.push_str(&output.stderr);
        if !output.stderr.ends_with('\n') {
            block.push('\n');
        }
    }
    block.push_str("```\n");
    block.push_str(&format!("exit code: {}", output.exit_code));
    block
}

/// Slice `content` into chunks of at most `size` chars, preserving
/// char boundaries.
fn chunk_content(content: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::client::AcpClientConfig;
    use crate::acp::pool::PoolConfig;
    use crate::breaker::BreakerConfig;
    use crate::sandbox::SandboxConfig;

    fn offline_orchestrator() -> SessionOrchestrator {
        SessionOrchestrator::new(
            SessionConfig::default(),
            AgentPool::new(PoolConfig::default(), AcpClientConfig::default()),
            CircuitBreaker::new("test", BreakerConfig::default()),
            SandboxManager::new(SandboxConfig::default()),
        )
    }

    #[test]
    fn shell_block_contains_output_and_exit_code() {
        let output = ExecOutput {
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        let block = format_shell_block("echo hi", &output);
        assert!(block.contains("$ echo hi"));
        assert!(block.contains("hi"));
        assert!(block.contains("exit code: 0"));
    }

    #[test]
    fn shell_block_includes_stderr() {
        let output = ExecOutput {
            stdout: String::new(),
            stderr: "no such file\n".to_string(),
            exit_code: 2,
        };
        let block = format_shell_block("ls /nope", &output);
        assert!(block.contains("no such file"));
        assert!(block.contains("exit code: 2"));
    }

    #[test]
    fn chunking_preserves_content_and_order() {
        let content = "abcdefghij".repeat(12); // 120 chars
        let chunks = chunk_content(&content, 50);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 50);
        assert_eq!(chunks[2].chars().count(), 20);
        assert_eq!(chunks.concat(), content);
    }

    #[test]
    fn chunking_handles_multibyte_chars() {
        let content = "héllo wörld".repeat(10);
        let chunks = chunk_content(&content, 7);
        assert_eq!(chunks.concat(), content);
    }

    #[tokio::test]
    async fn send_to_unknown_user_is_session_not_found() {
        let orchestrator = offline_orchestrator();
        let result = orchestrator
            .send_message_streaming("ghost", "s-1", "hello")
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_unknown_user_is_session_not_found() {
        let orchestrator = offline_orchestrator();
        let result = orchestrator.delete_user_session("ghost").await;
        assert!(matches!(
            result,
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }

    #[test]
    fn unknown_session_id_lookup_returns_none() {
        let orchestrator = offline_orchestrator();
        assert!(orchestrator.get_session("nope").is_none());
    }
}
