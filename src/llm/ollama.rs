//! Streaming chat client for an Ollama-compatible backend.
//!
//! The wire protocol is newline-delimited JSON: each line is a complete
//! chunk carrying a text delta and/or a partial tool-call batch, with a
//! `done` flag on the final chunk. Tool calls are accumulated across chunks
//! and delivered as one batch right before `Done`.

use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{ChatMessage, ChatOptions, LlmClient, LlmError, StreamEvent, ToolCall, ToolDefinition};

/// Default Ollama API base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
/// Default model.
pub const DEFAULT_MODEL: &str = "qwen2.5-coder:14b";
/// Default HTTP client timeout; generation can be slow.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Ollama API client.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    options: ChatOptions,
}

impl OllamaClient {
    /// Create a client with defaults, honoring the `OLLAMA_HOST` and
    /// `OLLAMA_MODEL` environment variables when set.
    pub fn new() -> Self {
        let base_url = std::env::var("OLLAMA_HOST")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("OLLAMA_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Self::with_config(base_url, model)
    }

    /// Create a client for a specific host and model.
    pub fn with_config(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        OllamaClient {
            client: Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            model: model.into(),
            options: ChatOptions::default(),
        }
    }

    /// Set generation options used for every request.
    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// The configured model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient for OllamaClient {
    fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
            stream: true,
            options: ModelOptions::from_chat_options(&self.options),
        };
        let client = self.client.clone();
        let url = self.chat_url();

        tokio::spawn(async move {
            if let Err(err) = stream_chat(&client, &url, request, &tx).await {
                let _ = tx.send(StreamEvent::Error(err)).await;
            }
        });

        rx
    }
}

/// Run one streaming chat request, emitting events on `tx`.
async fn stream_chat(
    client: &Client,
    url: &str,
    request: ChatRequest,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), LlmError> {
    tracing::debug!(model = %request.model, messages = request.messages.len(), "sending chat request");

    let response = client.post(url).json(&request).send().await.map_err(|e| {
        if e.is_timeout() {
            LlmError::network(format!("request timeout: {}", e))
        } else if e.is_connect() {
            LlmError::network(format!("connection failed: {}", e))
        } else {
            LlmError::network(format!("request failed: {}", e))
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::from_status(status.as_u16(), body));
    }

    let mut accumulated_tool_calls: Vec<ToolCall> = Vec::new();
    let mut buffer = String::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let bytes = chunk.map_err(|e| LlmError::network(format!("read stream: {}", e)))?;
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        // NDJSON: process every complete line in the buffer.
        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let chunk: ChunkResponse = serde_json::from_str(line)
                .map_err(|e| LlmError::protocol(format!("parse chunk: {} ({})", e, line)))?;

            if let Some(calls) = chunk.message.tool_calls {
                accumulated_tool_calls.extend(calls);
            }

            if let Some(content) = chunk.message.content {
                if !content.is_empty()
                    && tx.send(StreamEvent::TextDelta(content)).await.is_err()
                {
                    // Consumer went away; stop reading.
                    return Ok(());
                }
            }

            if chunk.done {
                if !accumulated_tool_calls.is_empty() {
                    let calls = std::mem::take(&mut accumulated_tool_calls);
                    if tx.send(StreamEvent::ToolCalls(calls)).await.is_err() {
                        return Ok(());
                    }
                }
                let _ = tx.send(StreamEvent::Done).await;
                return Ok(());
            }
        }
    }

    Err(LlmError::protocol(
        "stream ended without a done marker".to_string(),
    ))
}

/// Request body for `/api/chat`.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ModelOptions>,
}

/// Model generation options in the request body.
#[derive(Debug, Serialize)]
struct ModelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
}

impl ModelOptions {
    fn from_chat_options(options: &ChatOptions) -> Option<Self> {
        if options.temperature.is_none() && options.num_ctx.is_none() {
            return None;
        }
        Some(ModelOptions {
            temperature: options.temperature,
            num_ctx: options.num_ctx,
        })
    }
}

/// A single streaming chunk from `/api/chat`.
#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    message: ChunkMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}
