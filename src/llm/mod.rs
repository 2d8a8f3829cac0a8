//! LLM client module: the chat/tool-call contract and a streaming client.
//!
//! This module provides a trait-based abstraction over LLM backends. A chat
//! turn is sent with the full message history and a tool catalog; the model
//! answers with streamed text deltas and zero or more tool-call batches.
//! Tool-call batches may be split across stream chunks; clients accumulate
//! them and deliver all of them by the time the done marker arrives.

mod error;
mod ollama;

pub use error::{classify_http_status, LlmError, LlmErrorKind};
pub use ollama::OllamaClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Set on `Tool` messages: the id of the tool call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on `Tool` messages: the name of the tool that produced the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    /// Create a simple text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Create an assistant message carrying tool calls alongside its text.
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a tool-result message keyed by the tool call it answers.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        ChatMessage {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Some backends omit ids; callers fall back to the function name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

/// Function call details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON object.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Tool definition handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

/// Function definition with a JSON-schema parameter block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Optional generation parameters.
///
/// These are intentionally conservative; the goal is reproducibility.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Sampling temperature (0 = deterministic).
    pub temperature: Option<f64>,
    /// Context window size in tokens.
    pub num_ctx: Option<u32>,
}

/// One event in a streaming chat response.
#[derive(Debug)]
pub enum StreamEvent {
    /// A partial text chunk from the assistant.
    TextDelta(String),
    /// A batch of tool calls requested by the model. Clients accumulate
    /// partial batches internally, so every batch delivered here is whole.
    ToolCalls(Vec<ToolCall>),
    /// The stream completed normally.
    Done,
    /// The stream failed; no further events follow.
    Error(LlmError),
}

/// Trait for LLM clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat turn and stream the response.
    ///
    /// The returned channel yields text deltas interleaved with tool-call
    /// batches and terminates with either `Done` or `Error`.
    fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> mpsc::Receiver<StreamEvent>;

    /// Send a chat turn and collect the complete response message.
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Result<ChatMessage, LlmError> {
        let mut rx = self.chat_stream(messages, tools);
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextDelta(delta) => text.push_str(&delta),
                StreamEvent::ToolCalls(calls) => tool_calls.extend(calls),
                StreamEvent::Done => break,
                StreamEvent::Error(err) => return Err(err),
            }
        }

        Ok(ChatMessage::assistant(text, tool_calls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_serialization_skips_empty_fields() {
        let msg = ChatMessage::new(Role::User, "hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }

    #[test]
    fn test_tool_result_message_is_keyed() {
        let msg = ChatMessage::tool_result("call_1", "read", "file contents");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("read"));
    }

    #[test]
    fn test_tool_call_deserializes_without_id() {
        let call: ToolCall = serde_json::from_str(
            r#"{"type":"function","function":{"name":"read","arguments":{"file_path":"a.txt"}}}"#,
        )
        .unwrap();
        assert!(call.id.is_empty());
        assert_eq!(call.function.name, "read");
        assert_eq!(call.function.arguments["file_path"], "a.txt");
    }
}
