//! Per-user sandbox registry with idle eviction.

use std::path::Path;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::SandboxResult;
use crate::sandbox::executor::{ContainerCli, Sandbox};
use crate::sandbox::{SandboxConfig, container_name_for};

struct SandboxEntry {
    sandbox: Arc<Sandbox>,
    last_activity: Mutex<Instant>,
}

struct ManagerInner {
    config: SandboxConfig,
    sandboxes: DashMap<String, SandboxEntry>,
    /// Per-user creation locks so concurrent first requests cannot race
    /// two `docker run` calls for the same container name.
    creating: DashMap<String, Arc<AsyncMutex<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Registry of one sandbox per user, created lazily and evicted after
/// idling past the configured timeout.
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<ManagerInner>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                sandboxes: DashMap::new(),
                creating: DashMap::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Get the user's sandbox, creating and starting it on first use.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        workspace_override: Option<&Path>,
    ) -> SandboxResult<Arc<Sandbox>> {
        if let Some(entry) = self.inner.sandboxes.get(user_id) {
            *entry.last_activity.lock().unwrap() = Instant::now();
            return Ok(entry.sandbox.clone());
        }

        let lock = self
            .inner
            .creating
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another task may have finished creating while we waited.
        if let Some(entry) = self.inner.sandboxes.get(user_id) {
            *entry.last_activity.lock().unwrap() = Instant::now();
            return Ok(entry.sandbox.clone());
        }

        let cli = ContainerCli::detect()?;
        let workspace = match workspace_override {
            Some(path) => path.to_path_buf(),
            None => {
                let name = container_name_for(user_id);
                self.inner.config.workspace_root.join(
                    name.strip_prefix(crate::sandbox::CONTAINER_NAME_PREFIX)
                        .unwrap_or(&name),
                )
            }
        };
        tokio::fs::create_dir_all(&workspace).await?;

        let sandbox = Arc::new(Sandbox::new(
            cli,
            user_id,
            workspace,
            self.inner.config.image.clone(),
            self.inner.config.limits.clone(),
        )?);
        sandbox.start().await?;
        info!("created sandbox for user {user_id}");

        self.inner.sandboxes.insert(
            user_id.to_string(),
            SandboxEntry {
                sandbox: sandbox.clone(),
                last_activity: Mutex::new(Instant::now()),
            },
        );
        self.inner.creating.remove(user_id);
        Ok(sandbox)
    }

    /// The user's sandbox, if one is live.
    pub fn get(&self, user_id: &str) -> Option<Arc<Sandbox>> {
        self.inner
            .sandboxes
            .get(user_id)
            .map(|entry| entry.sandbox.clone())
    }

    /// Refresh the user's idle clock.
    pub fn touch(&self, user_id: &str) {
        if let Some(entry) = self.inner.sandboxes.get(user_id) {
            *entry.last_activity.lock().unwrap() = Instant::now();
        }
    }

    /// Stop and evict the user's sandbox.
    pub async fn stop(&self, user_id: &str) -> SandboxResult<()> {
        if let Some((_, entry)) = self.inner.sandboxes.remove(user_id) {
            entry.sandbox.stop().await?;
        }
        Ok(())
    }

    /// Stop every sandbox (shutdown path).
    pub async fn stop_all(&self) {
        let users: Vec<String> = self
            .inner
            .sandboxes
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for user in users {
            if let Err(err) = self.stop(&user).await {
                warn!("failed to stop sandbox for user {user}: {err}");
            }
        }
    }

    /// Start the periodic idle sweep.
    pub fn start_sweeper(&self) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.inner.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                manager.sweep_idle().await;
            }
        });

        let mut sweeper = self.inner.sweeper.lock().unwrap();
        if let Some(old) = sweeper.replace(handle) {
            old.abort();
        }
    }

    async fn sweep_idle(&self) {
        let idle_timeout = self.inner.config.idle_timeout;
        let idle_users: Vec<String> = self
            .inner
            .sandboxes
            .iter()
            .filter(|entry| entry.last_activity.lock().unwrap().elapsed() > idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for user in idle_users {
            info!("stopping idle sandbox for user {user}");
            if let Err(err) = self.stop(&user).await {
                warn!("failed to stop idle sandbox for user {user}: {err}");
            }
        }
    }

    /// Abort the sweeper and stop every sandbox.
    pub async fn shutdown(&self) {
        let handle = self.inner.sweeper.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.stop_all().await;
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("sandboxes", &self.inner.sandboxes.len())
            .finish()
    }
}
