//! Container sandbox for user-supplied commands.
//!
//! Every user gets at most one long-lived, resource-constrained
//! container with no access to the host beyond an explicitly mounted,
//! read-only workspace. The container name is a pure function of the
//! user id so restart and reconnect logic can always rediscover or
//! recreate the same container deterministically.

pub mod executor;
pub mod manager;
pub mod tools;

pub use executor::{ContainerCli, ExecOutput, Sandbox, SandboxInfo};
pub use manager::SandboxManager;
pub use tools::ToolExecutor;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};

/// Prefix for container names managed by this sandbox layer.
pub const CONTAINER_NAME_PREFIX: &str = "sandbox-";

/// Derive the deterministic container name for a user.
///
/// The user id is sanitized to the container-name alphabet; the result
/// is idempotent for a given user.
pub fn container_name_for(user_id: &str) -> String {
    let sanitized: String = user_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    format!("{CONTAINER_NAME_PREFIX}{sanitized}")
}

/// Per-container resource and security limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit (e.g. "512m").
    pub memory: String,
    /// CPU limit.
    pub cpus: f64,
    /// Writable scratch space (tmpfs size, e.g. "1g").
    pub disk_space: String,
    /// Whether the container gets outbound network access.
    pub network_access: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "512m".to_string(),
            cpus: 1.0,
            disk_space: "1g".to_string(),
            network_access: false,
        }
    }
}

/// Sandbox layer configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image for new sandbox containers.
    pub image: String,
    /// Base directory for per-user workspaces.
    pub workspace_root: PathBuf,
    /// Default resource limits for new sandboxes.
    pub limits: ResourceLimits,
    /// Idle time before a sandbox is stopped and evicted.
    pub idle_timeout: Duration,
    /// Idle sweep interval.
    pub sweep_interval: Duration,
    /// Tool output size before truncation (bytes).
    pub tool_output_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "quorum-sandbox:latest".to_string(),
            workspace_root: PathBuf::from("/tmp/quorum-workspaces"),
            limits: ResourceLimits::default(),
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            tool_output_limit: 10_000,
        }
    }
}

// ============================================================================
// Input validation
// ============================================================================
//
// Everything that reaches the container CLI is validated first so a
// hostile user id or snapshot name cannot smuggle arguments.

/// Validate a Docker/OCI image name.
///
/// Image names follow `[registry/][namespace/]name[:tag][@digest]`.
pub fn validate_image_name(image: &str) -> SandboxResult<()> {
    if image.is_empty() {
        return Err(SandboxError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(SandboxError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };
    if !image.chars().all(valid_chars) {
        return Err(SandboxError::InvalidInput(format!(
            "image name '{image}' contains invalid characters"
        )));
    }
    if image.contains("..") {
        return Err(SandboxError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name or id.
pub fn validate_container_name(name: &str) -> SandboxResult<()> {
    if name.is_empty() {
        return Err(SandboxError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    }
    if name.len() > 128 {
        return Err(SandboxError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(SandboxError::InvalidInput(format!(
            "container name '{name}' contains invalid characters"
        )));
    }

    Ok(())
}

/// Validate a memory/disk size spec (e.g. "512m", "1g").
pub fn validate_size_spec(spec: &str) -> SandboxResult<()> {
    let digits = spec.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let suffix = &spec[digits.len()..];
    let suffix_ok = matches!(
        suffix.to_ascii_lowercase().as_str(),
        "" | "b" | "k" | "m" | "g"
    );
    if digits.is_empty() || digits.parse::<u64>().is_err() || !suffix_ok {
        return Err(SandboxError::InvalidInput(format!(
            "invalid size spec '{spec}'"
        )));
    }
    Ok(())
}

/// Validate a host path used in a volume mount.
pub fn validate_mount_path(path: &str) -> SandboxResult<()> {
    if path.is_empty() {
        return Err(SandboxError::InvalidInput(
            "mount path cannot be empty".to_string(),
        ));
    }
    if path.contains('\0') {
        return Err(SandboxError::InvalidInput(
            "mount path cannot contain null bytes".to_string(),
        ));
    }
    // Colons and commas would split the -v / --tmpfs argument.
    if path.contains(':') || path.contains(',') {
        return Err(SandboxError::InvalidInput(format!(
            "mount path '{path}' contains reserved characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_deterministic_and_sanitized() {
        assert_eq!(container_name_for("alice"), "sandbox-alice");
        assert_eq!(container_name_for("alice"), container_name_for("alice"));
        assert_eq!(container_name_for("a/b;c"), "sandbox-abc");
        assert_eq!(container_name_for("user_1-x"), "sandbox-user_1-x");
    }

    #[test]
    fn image_name_validation() {
        assert!(validate_image_name("ubuntu:latest").is_ok());
        assert!(validate_image_name("registry.io/team/image:v1.0").is_ok());
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image$(whoami)").is_err());
        assert!(validate_image_name("../../etc/passwd").is_err());
    }

    #[test]
    fn container_name_validation() {
        assert!(validate_container_name("sandbox-alice").is_ok());
        assert!(validate_container_name("has space").is_err());
        assert!(validate_container_name("has;semicolon").is_err());
        assert!(validate_container_name("").is_err());
    }

    #[test]
    fn size_spec_validation() {
        assert!(validate_size_spec("512m").is_ok());
        assert!(validate_size_spec("1g").is_ok());
        assert!(validate_size_spec("1024").is_ok());
        assert!(validate_size_spec("lots").is_err());
        assert!(validate_size_spec("1x").is_err());
        assert!(validate_size_spec("").is_err());
    }

    #[test]
    fn mount_path_validation() {
        assert!(validate_mount_path("/tmp/workspaces/alice").is_ok());
        assert!(validate_mount_path("/tmp/a:b").is_err());
        assert!(validate_mount_path("").is_err());
    }
}
