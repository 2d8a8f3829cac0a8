//! Agent driver: the chat ⇄ tool round loop for a single turn.
//!
//! The driver sends the message history plus the full tool catalog, streams
//! the model's answer, executes any requested tool calls sequentially in the
//! order the model returned them, feeds results back, and repeats until the
//! model stops requesting tools or the round limit is hit. Events are
//! totally ordered and mirror the actual interleaving of text and tools.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatMessage, LlmClient, LlmError, StreamEvent};
use crate::tools::ToolRegistry;

/// Default number of chat ⇄ tool rounds before the driver gives up.
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 50;

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Working directory for tool execution.
    pub work_dir: PathBuf,
    /// Maximum chat ⇄ tool rounds per invocation.
    pub max_tool_rounds: u32,
}

impl AgentOptions {
    pub fn new(work_dir: PathBuf) -> Self {
        AgentOptions {
            work_dir,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

/// A streaming event from one driver invocation.
#[derive(Debug)]
pub enum DriverEvent {
    /// A partial text chunk from the assistant.
    TextDelta(String),
    /// The model invoked a tool.
    ToolStart {
        name: String,
        input: serde_json::Map<String, Value>,
    },
    /// A tool returned a result.
    ToolResult(String),
    /// The model finished without requesting more tools.
    Done,
    /// The invocation failed; no further events follow.
    Error(DriveError),
}

/// Why a driver invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("stream error: {0}")]
    Llm(#[from] LlmError),
    #[error("max tool rounds ({0}) exceeded")]
    RoundsExceeded(u32),
    #[error("tool '{name}' failed: {error}")]
    Tool { name: String, error: anyhow::Error },
    #[error("cancelled")]
    Cancelled,
}

impl DriveError {
    /// Whether the loop engine should retry the iteration.
    pub fn is_retryable(&self) -> bool {
        match self {
            DriveError::Llm(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Drive the agentic round loop, streaming events to the returned channel.
///
/// Cancelling the token aborts the upstream stream and any in-flight tool;
/// partially executed tools may leave filesystem state changed.
pub fn run_agent(
    cancel: CancellationToken,
    client: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    mut messages: Vec<ChatMessage>,
    opts: AgentOptions,
) -> mpsc::Receiver<DriverEvent> {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let tool_defs = tools.definitions();
        let max_rounds = opts.max_tool_rounds.max(1);

        for _round in 0..max_rounds {
            if cancel.is_cancelled() {
                let _ = tx.send(DriverEvent::Error(DriveError::Cancelled)).await;
                return;
            }

            let mut stream = client.chat_stream(messages.clone(), tool_defs.clone());
            let mut text = String::new();
            let mut tool_calls = Vec::new();

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(DriverEvent::Error(DriveError::Cancelled)).await;
                        return;
                    }
                    event = stream.recv() => event,
                };

                match event {
                    Some(StreamEvent::TextDelta(delta)) => {
                        text.push_str(&delta);
                        if tx.send(DriverEvent::TextDelta(delta)).await.is_err() {
                            return;
                        }
                    }
                    // Batches may arrive split across chunks; collect them
                    // all and only act once the stream is done.
                    Some(StreamEvent::ToolCalls(calls)) => tool_calls.extend(calls),
                    Some(StreamEvent::Error(err)) => {
                        let _ = tx.send(DriverEvent::Error(DriveError::Llm(err))).await;
                        return;
                    }
                    Some(StreamEvent::Done) | None => break,
                }
            }

            messages.push(ChatMessage::assistant(text, tool_calls.clone()));

            if tool_calls.is_empty() {
                let _ = tx.send(DriverEvent::Done).await;
                return;
            }

            // Execute sequentially in the order the model returned them;
            // parallel execution would make history reconstruction
            // nondeterministic.
            for call in tool_calls {
                let name = call.function.name.clone();
                let input = call
                    .function
                    .arguments
                    .as_object()
                    .cloned()
                    .unwrap_or_default();

                if tx
                    .send(DriverEvent::ToolStart {
                        name: name.clone(),
                        input,
                    })
                    .await
                    .is_err()
                {
                    return;
                }

                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(DriverEvent::Error(DriveError::Cancelled)).await;
                        return;
                    }
                    result = tools.execute(&name, &call.function.arguments, &opts.work_dir) => result,
                };

                let output = match result {
                    Ok(output) => output,
                    Err(err) => {
                        let _ = tx
                            .send(DriverEvent::Error(DriveError::Tool { name, error: err }))
                            .await;
                        return;
                    }
                };

                if tx.send(DriverEvent::ToolResult(output.clone())).await.is_err() {
                    return;
                }

                // Backends that omit call ids get the tool name as the key.
                let call_id = if call.id.is_empty() {
                    name.clone()
                } else {
                    call.id.clone()
                };
                messages.push(ChatMessage::tool_result(call_id, name, output));
            }
        }

        let _ = tx
            .send(DriverEvent::Error(DriveError::RoundsExceeded(max_rounds)))
            .await;
    });

    rx
}
