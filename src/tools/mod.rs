//! Filesystem and shell tools the agent can invoke during its loop.
//!
//! Tools are dispatched by name through a single registry. Two error
//! channels exist by design:
//!
//! - *Tool-level* errors (missing file, no regex match) are embedded in the
//!   returned output string; the model reads them and adjusts.
//! - *Fatal* errors (unparseable arguments, invalid working directory) are
//!   returned as `Err` and abort the agent turn.

mod file_ops;
mod search;
mod shell;

pub use file_ops::{EditFile, ListDir, ReadFile, WriteFile};
pub use search::{GlobFiles, GrepFiles};
pub use shell::Bash;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{FunctionDefinition, ToolDefinition};

/// A named side-effecting operation the model can request.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool's arguments.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool against a working directory.
    ///
    /// `Ok` carries the output string shown to the model, including
    /// tool-level error messages. `Err` is reserved for fatal failures.
    async fn execute(&self, args: &Value, working_dir: &Path) -> anyhow::Result<String>;
}

/// Resolve a path against the working directory when it is relative.
pub(crate) fn resolve_path(path_str: &str, working_dir: &Path) -> PathBuf {
    let path = Path::new(path_str);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}

/// Extract a required string argument, failing fatally when absent.
pub(crate) fn require_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing '{}' argument", key))
}

/// Cap tool output at `max` bytes, appending a truncation marker.
pub(crate) fn truncate_output(mut output: String, max: usize) -> String {
    if output.len() > max {
        // Cut on a char boundary at or below the cap.
        let mut cut = max;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        output.push_str("\n... (output truncated)");
    }
    output
}

/// Table of tools dispatched by name.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ToolRegistry {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Registry with the standard tool set.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ReadFile));
        registry.register(Box::new(WriteFile));
        registry.register(Box::new(EditFile));
        registry.register(Box::new(Bash));
        registry.register(Box::new(GlobFiles));
        registry.register(Box::new(GrepFiles));
        registry.register(Box::new(ListDir));
        registry
    }

    /// Add a tool to the table. New tools are additions here.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    /// The tool catalog in registration order, for the LLM request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect()
    }

    /// Execute the named tool with the given arguments.
    pub async fn execute(
        &self,
        name: &str,
        args: &Value,
        working_dir: &Path,
    ) -> anyhow::Result<String> {
        if !working_dir.is_dir() {
            anyhow::bail!(
                "working directory does not exist: {}",
                working_dir.display()
            );
        }

        let tool = match self.tools.get(name) {
            Some(tool) => tool,
            // Unknown tool names are the model's mistake, not ours.
            None => return Ok(format!("Error: unknown tool '{}'", name)),
        };

        // Some models double-encode arguments as a JSON string.
        let normalized;
        let args = match args {
            Value::Object(_) => args,
            Value::String(s) => {
                normalized = serde_json::from_str::<Value>(s)
                    .map_err(|e| anyhow::anyhow!("failed to parse '{}' arguments: {}", name, e))?;
                if !normalized.is_object() {
                    anyhow::bail!("'{}' arguments must be a JSON object", name);
                }
                &normalized
            }
            Value::Null => {
                normalized = Value::Object(serde_json::Map::new());
                &normalized
            }
            other => anyhow::bail!(
                "'{}' arguments must be a JSON object, got {}",
                name,
                other
            ),
        };

        tool.execute(args, working_dir).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
