//! Search tools: glob and grep.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::{DirEntry, WalkDir};

use super::{require_str, resolve_path, truncate_output, Tool};

/// Maximum number of glob matches returned.
const MAX_GLOB_RESULTS: usize = 200;
/// Output cap for `grep`.
const MAX_GREP_BYTES: usize = 4 * 1024;

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Walk entries under `root`, skipping hidden directories below the root.
fn walk(root: &Path) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && is_hidden(e)))
        .filter_map(|e| e.ok())
}

/// Match a whole glob pattern against a `/`-separated relative path.
///
/// `**` matches zero or more path components; `*` and `?` match within a
/// single component.
fn glob_match(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let segs: Vec<&str> = path.split('/').collect();
    match_components(&pat, &segs)
}

fn match_components(pat: &[&str], segs: &[&str]) -> bool {
    match pat.split_first() {
        None => segs.is_empty(),
        Some((&"**", rest)) => (0..=segs.len()).any(|i| match_components(rest, &segs[i..])),
        Some((p, rest)) => match segs.split_first() {
            Some((s, seg_rest)) => match_segment(p, s) && match_components(rest, seg_rest),
            None => false,
        },
    }
}

fn match_segment(pattern: &str, segment: &str) -> bool {
    fn matches(p: &[char], s: &[char]) -> bool {
        match p.split_first() {
            None => s.is_empty(),
            Some(('*', p_rest)) => (0..=s.len()).any(|i| matches(p_rest, &s[i..])),
            Some(('?', p_rest)) => s
                .split_first()
                .map_or(false, |(_, s_rest)| matches(p_rest, s_rest)),
            Some((c, p_rest)) => s
                .split_first()
                .map_or(false, |(sc, s_rest)| sc == c && matches(p_rest, s_rest)),
        }
    }

    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = segment.chars().collect();
    matches(&p, &s)
}

/// Find files matching a glob pattern.
pub struct GlobFiles;

#[async_trait]
impl Tool for GlobFiles {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern relative to the working directory. Supports ** for recursive matching, e.g. src/**/*.rs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "The glob pattern to match files against."
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: &Value, working_dir: &Path) -> anyhow::Result<String> {
        let pattern = require_str(args, "pattern")?
            .trim_start_matches("./")
            .to_string();
        let root = working_dir.to_path_buf();

        // The walk is blocking filesystem work; keep it off the async executor.
        let matches = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            for entry in walk(&root) {
                if entry.depth() == 0 {
                    continue;
                }
                let rel = match entry.path().strip_prefix(&root) {
                    Ok(rel) => rel,
                    Err(_) => continue,
                };
                let rel_str = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if glob_match(&pattern, &rel_str) {
                    matches.push(rel_str);
                    if matches.len() >= MAX_GLOB_RESULTS {
                        break;
                    }
                }
            }
            matches
        })
        .await?;

        if matches.is_empty() {
            return Ok("No files found matching pattern.".to_string());
        }

        Ok(matches.join("\n"))
    }
}

/// Search file contents for a regex pattern.
pub struct GrepFiles;

#[async_trait]
impl Tool for GrepFiles {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search files recursively for a regex pattern and return matching lines as path:line:content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "The regex pattern to search for."
                },
                "path": {
                    "type": "string",
                    "description": "Optional: the file or directory to search in. Defaults to the working directory."
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: &Value, working_dir: &Path) -> anyhow::Result<String> {
        let pattern = require_str(args, "pattern")?;
        let regex = match regex::Regex::new(pattern) {
            Ok(regex) => regex,
            Err(err) => return Ok(format!("Invalid pattern: {}", err)),
        };

        let search_root = match args.get("path").and_then(|v| v.as_str()) {
            Some(path) => resolve_path(path, working_dir),
            None => working_dir.to_path_buf(),
        };
        let base = working_dir.to_path_buf();

        let output = tokio::task::spawn_blocking(move || {
            let mut output = String::new();
            for entry in walk(&search_root) {
                if !entry.file_type().is_file() {
                    continue;
                }
                // Binary and unreadable files are skipped silently.
                let content = match std::fs::read_to_string(entry.path()) {
                    Ok(content) => content,
                    Err(_) => continue,
                };
                let display = entry
                    .path()
                    .strip_prefix(&base)
                    .unwrap_or(entry.path())
                    .display()
                    .to_string();
                for (lineno, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        output.push_str(&format!("{}:{}:{}\n", display, lineno + 1, line));
                        if output.len() > MAX_GREP_BYTES {
                            return output;
                        }
                    }
                }
            }
            output
        })
        .await?;

        if output.is_empty() {
            return Ok("No matches found.".to_string());
        }

        Ok(truncate_output(output, MAX_GREP_BYTES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_glob_match_basics() {
        assert!(glob_match("*.rs", "main.rs"));
        assert!(!glob_match("*.rs", "src/main.rs"));
        assert!(glob_match("src/*.rs", "src/main.rs"));
        assert!(glob_match("**/*.rs", "src/deep/nested/main.rs"));
        assert!(glob_match("**/*.rs", "main.rs"));
        assert!(glob_match("src/**", "src/a/b"));
        assert!(glob_match("fo?.txt", "foo.txt"));
        assert!(!glob_match("fo?.txt", "fool.txt"));
    }

    #[tokio::test]
    async fn test_glob_finds_nested_files() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("src/sub")).unwrap();
        std::fs::write(temp.path().join("src/main.rs"), "").unwrap();
        std::fs::write(temp.path().join("src/sub/util.rs"), "").unwrap();
        std::fs::write(temp.path().join("readme.md"), "").unwrap();

        let out = GlobFiles
            .execute(&json!({"pattern": "**/*.rs"}), temp.path())
            .await
            .unwrap();
        assert!(out.contains("src/main.rs"));
        assert!(out.contains("src/sub/util.rs"));
        assert!(!out.contains("readme.md"));
    }

    #[tokio::test]
    async fn test_glob_skips_hidden_directories() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join(".git/objects")).unwrap();
        std::fs::create_dir_all(temp.path().join("src/.cache")).unwrap();
        std::fs::write(temp.path().join(".git/objects/blob.x"), "").unwrap();
        std::fs::write(temp.path().join("src/.cache/entry.x"), "").unwrap();
        std::fs::write(temp.path().join("src/keep.x"), "").unwrap();

        let out = GlobFiles
            .execute(&json!({"pattern": "**/*.x"}), temp.path())
            .await
            .unwrap();
        assert!(out.contains("src/keep.x"));
        assert!(!out.contains("blob.x"));
        assert!(!out.contains("entry.x"));
    }

    #[tokio::test]
    async fn test_glob_no_matches() {
        let temp = tempdir().unwrap();
        let out = GlobFiles
            .execute(&json!({"pattern": "*.zig"}), temp.path())
            .await
            .unwrap();
        assert_eq!(out, "No files found matching pattern.");
    }

    #[tokio::test]
    async fn test_grep_reports_path_line_content() {
        let temp = tempdir().unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(
            temp.path().join("src/lib.rs"),
            "fn alpha() {}\nfn beta() {}\n",
        )
        .unwrap();

        let out = GrepFiles
            .execute(&json!({"pattern": "fn b\\w+"}), temp.path())
            .await
            .unwrap();
        assert!(out.contains("src/lib.rs:2:fn beta() {}"));
        assert!(!out.contains("alpha"));
    }

    #[tokio::test]
    async fn test_grep_no_matches_and_bad_pattern() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a.txt"), "hello").unwrap();

        let out = GrepFiles
            .execute(&json!({"pattern": "xyzzy"}), temp.path())
            .await
            .unwrap();
        assert_eq!(out, "No matches found.");

        let out = GrepFiles
            .execute(&json!({"pattern": "("}), temp.path())
            .await
            .unwrap();
        assert!(out.starts_with("Invalid pattern:"));
    }
}
