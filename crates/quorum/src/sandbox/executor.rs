//! Container sandbox executor.
//!
//! Drives the container runtime (docker or podman) through its CLI via
//! `tokio::process::Command`. Containers are created with a hardened
//! profile: non-root user, all capabilities dropped except the minimum
//! for file ownership changes, read-only root filesystem with a
//! writable noexec tmpfs, the workspace bind-mounted read-only, and
//! network disabled unless explicitly granted.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::{
    ResourceLimits, container_name_for, validate_container_name, validate_image_name,
    validate_mount_path, validate_size_spec,
};

/// Thin wrapper over the container runtime binary.
#[derive(Debug, Clone)]
pub struct ContainerCli {
    binary: String,
}

impl ContainerCli {
    /// Auto-detect an available runtime, preferring docker.
    pub fn detect() -> SandboxResult<Self> {
        for binary in ["docker", "podman"] {
            if Self::is_binary_available(binary) {
                return Ok(Self {
                    binary: binary.to_string(),
                });
            }
        }
        Err(SandboxError::NoRuntime)
    }

    /// Use a specific runtime binary.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run a runtime subcommand and return stdout.
    async fn run(&self, args: &[&str]) -> SandboxResult<String> {
        let command = args.first().copied().unwrap_or_default().to_string();
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SandboxError::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::CommandFailed {
                command,
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Container state status via inspect, `Ok(None)` when the
    /// container does not exist.
    async fn state_status(&self, name: &str) -> SandboxResult<Option<String>> {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Status}}", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::CommandFailed {
                command: "inspect".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Ok(None);
        }

        let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if status.is_empty() {
            return Ok(None);
        }
        Ok(Some(status))
    }
}

/// Output of one sandboxed command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Best-effort sandbox introspection. Degrades to a "not created"
/// status instead of erroring when the container does not exist.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub container_name: String,
    pub image: String,
    pub status: String,
    pub workspace_dir: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
}

/// One user's persistent sandbox container.
pub struct Sandbox {
    cli: ContainerCli,
    user_id: String,
    container_name: String,
    /// Mutable because `load` swaps in a snapshot image.
    image: std::sync::RwLock<String>,
    workspace_dir: PathBuf,
    limits: ResourceLimits,
    running: AtomicBool,
}

impl Sandbox {
    /// Build a sandbox description. Does not touch the runtime.
    pub fn new(
        cli: ContainerCli,
        user_id: impl Into<String>,
        workspace_dir: PathBuf,
        image: impl Into<String>,
        limits: ResourceLimits,
    ) -> SandboxResult<Self> {
        let user_id = user_id.into();
        let image = image.into();
        let container_name = container_name_for(&user_id);

        validate_image_name(&image)?;
        validate_container_name(&container_name)?;
        validate_size_spec(&limits.memory)?;
        validate_size_spec(&limits.disk_space)?;
        validate_mount_path(&workspace_dir.to_string_lossy())?;

        Ok(Self {
            cli,
            user_id,
            container_name,
            image: std::sync::RwLock::new(image),
            workspace_dir,
            limits,
            running: AtomicBool::new(false),
        })
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn workspace_dir(&self) -> &std::path::Path {
        &self.workspace_dir
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn image(&self) -> String {
        self.image.read().unwrap().clone()
    }

    /// Start the container. No-op if already running; reuses an
    /// existing stopped container by name, otherwise creates a new one.
    pub async fn start(&self) -> SandboxResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        match self.cli.state_status(&self.container_name).await? {
            Some(status) if status == "running" => {
                debug!("sandbox {} already running", self.container_name);
            }
            Some(status) => {
                debug!(
                    "starting existing sandbox {} (was {status})",
                    self.container_name
                );
                self.cli.run(&["start", &self.container_name]).await?;
            }
            None => self.create().await?,
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create(&self) -> SandboxResult<()> {
        let image = self.image();
        let workspace = self.workspace_dir.to_string_lossy().to_string();
        let network = if self.limits.network_access {
            "bridge"
        } else {
            "none"
        };
        let cpus = self.limits.cpus.to_string();
        let tmpfs = format!("/tmp:rw,noexec,nosuid,size={}", self.limits.disk_space);
        let volume = format!("{workspace}:/workspace:ro");

        info!(
            "creating sandbox {} (image {image}, network {network})",
            self.container_name
        );

        let args: Vec<&str> = vec![
            "run",
            "-d",
            "--name",
            &self.container_name,
            "--user",
            "1000:1000",
            "--security-opt",
            "no-new-privileges:true",
            "--cap-drop",
            "ALL",
            "--cap-add",
            "CHOWN",
            "--cap-add",
            "SETUID",
            "--cap-add",
            "SETGID",
            "--read-only",
            "--tmpfs",
            &tmpfs,
            "-v",
            &volume,
            "-w",
            "/workspace",
            "--network",
            network,
            "--memory",
            &self.limits.memory,
            "--cpus",
            &cpus,
            &image,
            "tail",
            "-f",
            "/dev/null",
        ];

        self.cli.run(&args).await?;
        Ok(())
    }

    /// Execute a command inside the container.
    ///
    /// Stdout and stderr are captured separately; a non-zero exit is
    /// reported through `exit_code`, not as an error. Cancelling the
    /// token kills the in-flight process.
    pub async fn execute(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> SandboxResult<ExecOutput> {
        self.start().await?;

        let mut child = Command::new(self.cli.binary())
            .args([
                "exec",
                "-w",
                "/workspace",
                &self.container_name,
                "/bin/bash",
                "-c",
                command,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The exec must not outlive its caller if the future is
            // dropped without a cancel signal.
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let result = {
            let gather = async {
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();
                // Drain both pipes while waiting so a chatty command
                // cannot fill one pipe and stall the child.
                let (stdout_read, stderr_read, status) = tokio::join!(
                    async {
                        match stdout_pipe.as_mut() {
                            Some(pipe) => pipe.read_to_end(&mut stdout).await.map(|_| ()),
                            None => Ok(()),
                        }
                    },
                    async {
                        match stderr_pipe.as_mut() {
                            Some(pipe) => pipe.read_to_end(&mut stderr).await.map(|_| ()),
                            None => Ok(()),
                        }
                    },
                    child.wait(),
                );
                stdout_read?;
                stderr_read?;
                let status = status?;
                Ok::<ExecOutput, std::io::Error>(ExecOutput {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    exit_code: status.code().unwrap_or(-1),
                })
            };
            tokio::pin!(gather);

            tokio::select! {
                _ = cancel.cancelled() => None,
                result = &mut gather => Some(result),
            }
        };

        match result {
            Some(output) => Ok(output?),
            None => {
                warn!(
                    "killing cancelled command in sandbox {}",
                    self.container_name
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(SandboxError::Cancelled)
            }
        }
    }

    /// Destroy and recreate the container.
    pub async fn reset(&self) -> SandboxResult<()> {
        if self.cli.state_status(&self.container_name).await?.is_some() {
            self.cli.run(&["rm", "-f", &self.container_name]).await?;
        }
        self.running.store(false, Ordering::SeqCst);
        self.start().await?;
        info!("reset sandbox {}", self.container_name);
        Ok(())
    }

    /// Restart the container in place.
    pub async fn restart(&self) -> SandboxResult<()> {
        if self.cli.state_status(&self.container_name).await?.is_none() {
            return Err(SandboxError::NotFound(self.container_name.clone()));
        }
        self.cli.run(&["restart", &self.container_name]).await?;
        self.running.store(true, Ordering::SeqCst);
        info!("restarted sandbox {}", self.container_name);
        Ok(())
    }

    /// Snapshot the container state as an image and return its name.
    pub async fn save(&self, snapshot_name: Option<&str>) -> SandboxResult<String> {
        let image_name = match snapshot_name {
            Some(name) => {
                validate_image_name(name)?;
                name.to_string()
            }
            None => format!(
                "{}-snapshot-{}",
                self.container_name,
                chrono::Utc::now().timestamp()
            ),
        };

        if self.cli.state_status(&self.container_name).await?.is_none() {
            return Err(SandboxError::NotFound(self.container_name.clone()));
        }
        self.cli
            .run(&["commit", &self.container_name, &image_name])
            .await?;
        info!("saved sandbox snapshot {image_name}");
        Ok(image_name)
    }

    /// Replace the container with one created from a saved snapshot.
    pub async fn load(&self, snapshot_name: &str) -> SandboxResult<()> {
        validate_image_name(snapshot_name)?;

        if self.cli.state_status(&self.container_name).await?.is_some() {
            self.cli.run(&["rm", "-f", &self.container_name]).await?;
        }
        self.running.store(false, Ordering::SeqCst);
        *self.image.write().unwrap() = snapshot_name.to_string();
        self.start().await?;
        info!("loaded sandbox snapshot {snapshot_name}");
        Ok(())
    }

    /// List snapshot images saved from this sandbox.
    pub async fn list_snapshots(&self) -> SandboxResult<Vec<String>> {
        let reference = format!("{}-snapshot-*", self.container_name);
        let stdout = self
            .cli
            .run(&[
                "images",
                "--filter",
                &format!("reference={reference}"),
                "--format",
                "{{.Repository}}:{{.Tag}}",
            ])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Stop the container.
    pub async fn stop(&self) -> SandboxResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.cli.run(&["stop", &self.container_name]).await?;
        self.running.store(false, Ordering::SeqCst);
        info!("stopped sandbox {}", self.container_name);
        Ok(())
    }

    /// Best-effort introspection; never errors for a missing container.
    pub async fn info(&self) -> SandboxInfo {
        let base = SandboxInfo {
            container_name: self.container_name.clone(),
            image: self.image(),
            status: "not created".to_string(),
            workspace_dir: self.workspace_dir.to_string_lossy().to_string(),
            user_id: self.user_id.clone(),
            uptime: None,
            memory: None,
            cpu: None,
        };

        let inspected = self
            .cli
            .run(&[
                "inspect",
                &self.container_name,
                "--format",
                "{{.State.Status}}|{{.State.StartedAt}}|{{.HostConfig.Memory}}|{{.HostConfig.NanoCpus}}",
            ])
            .await;

        let Ok(line) = inspected else {
            return base;
        };
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 4 {
            return base;
        }

        let status = parts[0].to_string();
        let uptime = if status == "running" {
            chrono::DateTime::parse_from_rfc3339(parts[1])
                .ok()
                .map(|started| {
                    let elapsed = chrono::Utc::now().signed_duration_since(started);
                    let hours = elapsed.num_hours();
                    let minutes = elapsed.num_minutes() % 60;
                    format!("{hours}h {minutes}m")
                })
        } else {
            None
        };
        let memory = parts[2]
            .parse::<u64>()
            .ok()
            .filter(|bytes| *bytes > 0)
            .map(|bytes| format!("{:.1}GB", bytes as f64 / 1_073_741_824.0));
        let cpu = parts[3]
            .parse::<u64>()
            .ok()
            .filter(|nanos| *nanos > 0)
            .map(|nanos| format!("{} CPUs", nanos as f64 / 1_000_000_000.0));

        SandboxInfo {
            status,
            uptime,
            memory,
            cpu,
            ..base
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("container_name", &self.container_name)
            .field("workspace_dir", &self.workspace_dir)
            .finish()
    }
}
