//! The fixed per-iteration agent prompt and the reserved control tokens
//! the model emits inside its assistant text.

use std::path::Path;

/// Emitted by the model when every story in the PRD passes.
pub const COMPLETE_TOKEN: &str = "<complete/>";

/// Opening tag of the story-start marker (`<status>US-001</status>`).
pub const STATUS_OPEN_TAG: &str = "<status>";

/// Closing tag of the story-start marker.
pub const STATUS_CLOSE_TAG: &str = "</status>";

const PRD_PATH_PLACEHOLDER: &str = "{{PRD_PATH}}";

const AGENT_PROMPT_TEMPLATE: &str = r#"You are an autonomous coding agent working through a product requirements document (PRD).

The PRD lives at: {{PRD_PATH}}

Follow this exact workflow:

1. Read the PRD with the read tool. It is a JSON document with a "userStories" array. Each story has "id", "title", "description", "acceptanceCriteria", "priority", "passes", and "inProgress" fields.
2. Pick the next story to work on: the story with the LOWEST priority number among stories where "passes" is false. If every story has "passes": true, output <complete/> and stop.
3. Announce the story you are starting by outputting <status>STORY-ID</status> on its own line, substituting the story's real id.
4. Mark the story as started: use the edit tool on the PRD to change that story's "inProgress" from false to true.
5. Implement the story in the working directory using the read, write, edit, glob, grep, list, and bash tools. Satisfy every acceptance criterion. Run the project's tests with bash where they exist.
6. When the story's acceptance criteria are met, use the edit tool on the PRD to set the story's "passes" to true and "inProgress" to false.
7. Commit your work with bash: git add -A && git commit -m "feat: STORY-ID short description"
8. If stories remain with "passes": false, go back to step 2. When all stories pass, output <complete/>.

Rules:
- Work on ONE story at a time, in priority order.
- Never edit a story's id, title, description, acceptanceCriteria, or priority. Only flip "inProgress" and "passes".
- Never set "passes" to true without implementing the story.
- The tokens <complete/> and <status>...</status> are reserved; do not use them for anything else.
"#;

/// Render the iteration prompt for a PRD file.
///
/// The path is substituted verbatim, so callers should pass an absolute path.
pub fn agent_prompt(prd_path: &Path) -> String {
    AGENT_PROMPT_TEMPLATE.replace(PRD_PATH_PLACEHOLDER, &prd_path.to_string_lossy())
}

/// Extract a story id from assistant text containing `<status>ID</status>`.
///
/// Returns `None` when no complete marker pair is present.
pub fn extract_story_id(text: &str) -> Option<String> {
    let start = text.find(STATUS_OPEN_TAG)? + STATUS_OPEN_TAG.len();
    let end = text[start..].find(STATUS_CLOSE_TAG)?;
    let id = text[start..start + end].trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Check whether assistant text contains the completion marker.
pub fn contains_complete(text: &str) -> bool {
    text.contains(COMPLETE_TOKEN)
}
