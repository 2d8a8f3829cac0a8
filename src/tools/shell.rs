//! Shell command execution tool.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{require_str, truncate_output, Tool};

/// Output cap for `bash`.
const MAX_BASH_BYTES: usize = 8 * 1024;
/// Wall-clock cap for a single command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Sanitize command output for model consumption: strip control characters
/// that are neither newlines nor tabs.
fn sanitize_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || c >= ' ')
        .collect()
}

/// Run a shell command and return its output.
pub struct Bash;

#[async_trait]
impl Tool for Bash {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory and return its output. Use for running tests, builds, git commits, etc."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: &Value, working_dir: &Path) -> anyhow::Result<String> {
        let command = require_str(args, "command")?;

        tracing::debug!(cwd = %working_dir.display(), command, "executing shell command");

        let child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future (cancellation) must not orphan the process.
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(err) => return Ok(format!("Error spawning command: {}", err)),
        };

        let output = match tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Ok(format!("Error running command: {}", err)),
            Err(_) => {
                return Ok(format!(
                    "Error: command timed out after {} seconds",
                    COMMAND_TIMEOUT.as_secs()
                ));
            }
        };

        let mut result = sanitize_output(&output.stdout);
        let stderr = sanitize_output(&output.stderr);
        if !stderr.is_empty() {
            result.push_str("\n[stderr]\n");
            result.push_str(&stderr);
        }
        if !output.status.success() {
            result.push_str(&format!(
                "\n[exit code: {}]",
                output.status.code().unwrap_or(-1)
            ));
        }

        Ok(truncate_output(result, MAX_BASH_BYTES))
    }
}
