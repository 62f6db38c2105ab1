//! Sandboxed tool executor.
//!
//! Fallback executor for `tools.execute` batches: shell tool calls run
//! inside the user's sandbox container instead of on the host.
//! Oversized output is truncated head-first with a marker so a runaway
//! command cannot flood the caller.

use std::sync::Arc;

use log::debug;
use tokio_util::sync::CancellationToken;

use quorum_protocol::{ToolCallRequest, ToolCallResult};

use crate::sandbox::executor::Sandbox;

/// Tool names treated as shell commands.
const SHELL_TOOLS: &[&str] = &["run_shell_command", "shell", "bash"];

/// Marker appended to truncated output.
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Whether a tool call should be intercepted for sandbox execution.
pub fn is_shell_tool(name: &str) -> bool {
    SHELL_TOOLS.contains(&name)
}

/// Truncate `output` to at most `limit` bytes on a char boundary.
/// Returns the (possibly truncated) text and whether truncation happened.
pub fn truncate_output(output: &str, limit: usize) -> (String, bool) {
    if output.len() <= limit {
        return (output.to_string(), false);
    }
    let mut cut = limit;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = output[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    (truncated, true)
}

/// Executes shell tool calls inside one user's sandbox.
pub struct ToolExecutor {
    sandbox: Arc<Sandbox>,
    output_limit: usize,
}

impl ToolExecutor {
    pub fn new(sandbox: Arc<Sandbox>, output_limit: usize) -> Self {
        Self {
            sandbox,
            output_limit,
        }
    }

    /// Run a batch of tool calls, one result per call.
    ///
    /// Unsupported tool names and malformed parameters fail their own
    /// call, not the batch. Cancellation kills the in-flight command
    /// and fails the remaining calls.
    pub async fn execute_tools(
        &self,
        calls: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
    ) -> Vec<ToolCallResult> {
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            if cancel.is_cancelled() {
                results.push(error_result(&call.call_id, "execution cancelled"));
                continue;
            }

            if !is_shell_tool(&call.name) {
                results.push(error_result(
                    &call.call_id,
                    &format!("unsupported tool: {}", call.name),
                ));
                continue;
            }

            let Some(command) = call.parameters.get("command").and_then(|v| v.as_str()) else {
                results.push(error_result(&call.call_id, "missing command parameter"));
                continue;
            };

            debug!("executing sandboxed tool command: {command}");
            match self.sandbox.execute(command, cancel).await {
                Ok(output) => {
                    let combined = if output.stdout.is_empty() {
                        output.stderr
                    } else {
                        output.stdout
                    };
                    let (content, truncated) = truncate_output(&combined, self.output_limit);
                    if truncated {
                        debug!(
                            "truncated tool output for call {} to {} bytes",
                            call.call_id, self.output_limit
                        );
                    }
                    results.push(ToolCallResult {
                        call_id: call.call_id,
                        output: content,
                        exit_code: output.exit_code,
                        error: None,
                    });
                }
                Err(err) => {
                    results.push(error_result(&call.call_id, &err.to_string()));
                }
            }
        }

        results
    }
}

fn error_result(call_id: &str, message: &str) -> ToolCallResult {
    ToolCallResult {
        call_id: call_id.to_string(),
        output: String::new(),
        exit_code: -1,
        error: Some(message.to_string()),
    }
}
