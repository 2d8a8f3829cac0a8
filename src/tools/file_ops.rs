//! File operation tools: read, write, edit, list.
//!
//! Paths can be absolute or relative to the working directory. IO failures
//! are reported in the output string so the model can react to them.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{require_str, resolve_path, truncate_output, Tool};

/// Output cap for `read`.
const MAX_READ_BYTES: usize = 12 * 1024;

/// Read the contents of a file, optionally sliced to a line range.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path. Optionally pass start_line and end_line (1-based, inclusive) to read a slice."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "The path to the file to read."
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: first line to read (1-based)."
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: last line to read (inclusive)."
                }
            },
            "required": ["file_path"]
        })
    }

    async fn execute(&self, args: &Value, working_dir: &Path) -> anyhow::Result<String> {
        let path = require_str(args, "file_path")?;
        let full_path = resolve_path(path, working_dir);

        let content = match tokio::fs::read_to_string(&full_path).await {
            Ok(content) => content,
            Err(err) => return Ok(format!("Error reading file: {}", err)),
        };

        let start_line = args.get("start_line").and_then(|v| v.as_u64());
        let end_line = args.get("end_line").and_then(|v| v.as_u64());

        let output = if start_line.is_some() || end_line.is_some() {
            let lines: Vec<&str> = content.lines().collect();
            let total = lines.len();
            let start = start_line.unwrap_or(1).max(1) as usize - 1;
            let end = (end_line.unwrap_or(total as u64) as usize).min(total);

            if start >= total {
                return Ok(format!(
                    "File has {} lines, requested start line {} is beyond end of file",
                    total,
                    start + 1
                ));
            }

            lines[start..end.max(start)].join("\n")
        } else {
            content
        };

        Ok(truncate_output(output, MAX_READ_BYTES))
    }
}

/// Write content to a file, creating it or overwriting it.
pub struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it or overwriting it. Parent directories are created as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "The path to the file to write."
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file."
                }
            },
            "required": ["file_path", "content"]
        })
    }

    async fn execute(&self, args: &Value, working_dir: &Path) -> anyhow::Result<String> {
        let path = require_str(args, "file_path")?;
        let content = require_str(args, "content")?;
        let full_path = resolve_path(path, working_dir);

        if let Some(parent) = full_path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                return Ok(format!("Error creating directories: {}", err));
            }
        }

        match tokio::fs::write(&full_path, content).await {
            Ok(()) => Ok(format!("Wrote {} bytes to {}", content.len(), path)),
            Err(err) => Ok(format!("Error writing file: {}", err)),
        }
    }
}

/// Edit a file by replacing the first occurrence of an exact string.
pub struct EditFile;

#[async_trait]
impl Tool for EditFile {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing the first occurrence of old_string with new_string. old_string must match the file contents exactly."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "The path to the file to edit."
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact string to find and replace."
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement string."
                }
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    async fn execute(&self, args: &Value, working_dir: &Path) -> anyhow::Result<String> {
        let path = require_str(args, "file_path")?;
        let old_string = require_str(args, "old_string")?;
        let new_string = require_str(args, "new_string")?;
        let full_path = resolve_path(path, working_dir);

        let content = match tokio::fs::read_to_string(&full_path).await {
            Ok(content) => content,
            Err(err) => return Ok(format!("Error reading file for edit: {}", err)),
        };

        if !content.contains(old_string) {
            return Ok(format!("Error: old_string not found in {}", path));
        }

        let new_content = content.replacen(old_string, new_string, 1);
        match tokio::fs::write(&full_path, new_content).await {
            Ok(()) => Ok(format!("Edited {}", path)),
            Err(err) => Ok(format!("Error writing edited file: {}", err)),
        }
    }
}

/// List a directory's entries.
pub struct ListDir;

#[async_trait]
impl Tool for ListDir {
    fn name(&self) -> &str {
        "list"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories are marked with a trailing slash; files show their size in bytes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The directory to list. Defaults to the working directory."
                }
            }
        })
    }

    async fn execute(&self, args: &Value, working_dir: &Path) -> anyhow::Result<String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let full_path = resolve_path(path, working_dir);

        let mut read_dir = match tokio::fs::read_dir(&full_path).await {
            Ok(rd) => rd,
            Err(err) => return Ok(format!("Error listing directory: {}", err)),
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            match entry.metadata().await {
                Ok(meta) if meta.is_dir() => entries.push(format!("{}/", name)),
                Ok(meta) => entries.push(format!("{} ({} bytes)", name, meta.len())),
                Err(_) => entries.push(name),
            }
        }

        if entries.is_empty() {
            return Ok("(empty directory)".to_string());
        }

        entries.sort();
        Ok(entries.join("\n"))
    }
}
