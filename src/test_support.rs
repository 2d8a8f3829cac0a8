//! Shared helpers for tests: a scripted LLM client and a scratch git repo.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::llm::{
    ChatMessage, FunctionCall, LlmClient, LlmError, StreamEvent, ToolCall, ToolDefinition,
};

/// Build a tool call the way a backend would return it.
pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        call_type: "function".to_string(),
        function: FunctionCall {
            name: name.to_string(),
            arguments,
        },
    }
}

/// One scripted chat turn: text deltas, then an optional tool-call batch,
/// or an error instead.
pub struct ScriptedTurn {
    pub deltas: Vec<String>,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<LlmError>,
}

impl ScriptedTurn {
    pub fn text(deltas: &[&str]) -> Self {
        ScriptedTurn {
            deltas: deltas.iter().map(|s| s.to_string()).collect(),
            tool_calls: Vec::new(),
            error: None,
        }
    }

    pub fn error(error: LlmError) -> Self {
        ScriptedTurn {
            deltas: Vec::new(),
            tool_calls: Vec::new(),
            error: Some(error),
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// An `LlmClient` that replays scripted turns, one per `chat_stream` call,
/// recording the message history it was handed each time.
///
/// When the script runs out, further calls yield an empty completed turn.
pub struct ScriptedClient {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedClient {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        ScriptedClient {
            turns: Mutex::new(turns.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Number of scripted turns not yet consumed.
    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap().len()
    }

    /// The message histories received so far, one per `chat_stream` call.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }
}

impl LlmClient for ScriptedClient {
    fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        _tools: Vec<ToolDefinition>,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        self.calls.lock().unwrap().push(messages);
        let turn = self.turns.lock().unwrap().pop_front();

        tokio::spawn(async move {
            let turn = match turn {
                Some(turn) => turn,
                None => {
                    let _ = tx.send(StreamEvent::Done).await;
                    return;
                }
            };

            if let Some(error) = turn.error {
                let _ = tx.send(StreamEvent::Error(error)).await;
                return;
            }

            for delta in turn.deltas {
                if tx.send(StreamEvent::TextDelta(delta)).await.is_err() {
                    return;
                }
            }
            if !turn.tool_calls.is_empty() {
                if tx.send(StreamEvent::ToolCalls(turn.tool_calls)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamEvent::Done).await;
        });

        rx
    }
}

/// A scratch git repository on `main` with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let repo = TestRepo { dir };
        repo.git(&["init", "-b", "main"]);
        repo.git(&["config", "user.email", "test@example.com"]);
        repo.git(&["config", "user.name", "Test User"]);
        repo.write_file("README.md", "# test repo\n");
        repo.git(&["add", "-A"]);
        repo.git(&["commit", "-m", "initial commit"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run a git command in the repo, panicking on failure.
    pub fn git(&self, args: &[&str]) {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(self.dir.path())
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    pub fn write_file(&self, rel: &str, content: &str) {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(path, content).expect("write file");
    }

    pub fn read_file(&self, rel: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(rel)).expect("read file")
    }
}
