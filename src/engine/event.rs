//! Events emitted by the agent loop.

use serde_json::Value;

/// An event from one PRD's agent loop.
///
/// Within a loop, events are strictly ordered by real execution order.
/// Across loops no global order exists; the manager tags each event with
/// its PRD name when multiplexing.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A new iteration began.
    IterationStart { iteration: u32 },
    /// The model produced text.
    AssistantText { iteration: u32, text: String },
    /// The model invoked a tool.
    ToolStart {
        iteration: u32,
        tool: String,
        input: serde_json::Map<String, Value>,
    },
    /// A tool returned a result.
    ToolResult { iteration: u32, text: String },
    /// The model announced it is starting a story.
    StoryStarted {
        iteration: u32,
        story_id: String,
        text: String,
    },
    /// A story newly passed. Consumers may also derive this from the store;
    /// the loop reports completion wholesale via `Complete`.
    StoryCompleted { iteration: u32, story_id: String },
    /// Every story passes, or the model emitted the completion marker.
    Complete { iteration: u32 },
    /// The iteration cap was reached without completing the PRD.
    MaxIterationsReached { iteration: u32 },
    /// Something failed. Terminal errors end the loop; non-terminal ones
    /// (auto-push failures) let it continue.
    Error {
        iteration: u32,
        message: String,
        terminal: bool,
    },
    /// An iteration failed and is being retried.
    Retrying {
        iteration: u32,
        attempt: u32,
        max_attempts: u32,
    },
}

impl AgentEvent {
    /// Short tag for logging and assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::IterationStart { .. } => "IterationStart",
            AgentEvent::AssistantText { .. } => "AssistantText",
            AgentEvent::ToolStart { .. } => "ToolStart",
            AgentEvent::ToolResult { .. } => "ToolResult",
            AgentEvent::StoryStarted { .. } => "StoryStarted",
            AgentEvent::StoryCompleted { .. } => "StoryCompleted",
            AgentEvent::Complete { .. } => "Complete",
            AgentEvent::MaxIterationsReached { .. } => "MaxIterationsReached",
            AgentEvent::Error { .. } => "Error",
            AgentEvent::Retrying { .. } => "Retrying",
        }
    }

    /// The iteration the event belongs to.
    pub fn iteration(&self) -> u32 {
        match self {
            AgentEvent::IterationStart { iteration }
            | AgentEvent::AssistantText { iteration, .. }
            | AgentEvent::ToolStart { iteration, .. }
            | AgentEvent::ToolResult { iteration, .. }
            | AgentEvent::StoryStarted { iteration, .. }
            | AgentEvent::StoryCompleted { iteration, .. }
            | AgentEvent::Complete { iteration }
            | AgentEvent::MaxIterationsReached { iteration }
            | AgentEvent::Error { iteration, .. }
            | AgentEvent::Retrying { iteration, .. } => *iteration,
        }
    }

    /// A one-line rendering for log mirroring, when the event carries
    /// something worth showing.
    pub fn display_text(&self) -> Option<String> {
        match self {
            AgentEvent::AssistantText { text, .. } => Some(text.clone()),
            AgentEvent::StoryStarted { story_id, .. } => {
                Some(format!("Starting story {}", story_id))
            }
            AgentEvent::StoryCompleted { story_id, .. } => {
                Some(format!("Completed story {}", story_id))
            }
            AgentEvent::ToolStart { tool, .. } => Some(format!("Tool: {}", tool)),
            AgentEvent::Error { message, .. } => Some(format!("Error: {}", message)),
            AgentEvent::Retrying {
                attempt,
                max_attempts,
                ..
            } => Some(format!("Retrying ({}/{})...", attempt, max_attempts)),
            AgentEvent::Complete { .. } => Some("PRD complete".to_string()),
            AgentEvent::MaxIterationsReached { .. } => {
                Some("Max iterations reached".to_string())
            }
            AgentEvent::IterationStart { .. } | AgentEvent::ToolResult { .. } => None,
        }
    }
}
