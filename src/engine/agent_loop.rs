//! The per-PRD agent loop.
//!
//! One `Loop` owns one PRD. Each iteration renders the fixed prompt, drives
//! the agent until it stops requesting tools, reconciles the PRD file into
//! the store, auto-commits newly passing stories, and checks for
//! completion. Iterations repeat until the PRD completes, the model emits
//! the completion marker, or the iteration cap is reached.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event::AgentEvent;
use crate::agent::{run_agent, AgentOptions, DriveError, DriverEvent};
use crate::llm::{ChatMessage, LlmClient, Role};
use crate::paths;
use crate::prd::Prd;
use crate::prompt;
use crate::store::Store;
use crate::tools::ToolRegistry;

/// Buffer size of the loop's event channel. Producers block when the
/// consumer falls this far behind.
const EVENT_BUFFER: usize = 100;

/// Auto-commit messages longer than this collapse to a count.
const MAX_COMMIT_SUBJECT: usize = 120;

/// Automatic retry behavior for failed iterations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Delays between retries; the last entry repeats.
    pub retry_delays: Vec<Duration>,
    /// Whether retry is enabled.
    pub enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            retry_delays: vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(15),
            ],
            enabled: true,
        }
    }
}

/// Why a loop run returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopTermination {
    /// Every story passes or the completion marker was observed.
    Complete,
    /// The iteration cap was reached; the loop may be started again.
    MaxIterationsReached,
    /// Stopped by the user or a cancelled context.
    Stopped,
    /// Paused; the next run resumes from the same iteration counter.
    Paused,
}

/// A terminal loop failure.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("failed to open log file: {0}")]
    LogFile(std::io::Error),
    #[error(transparent)]
    Driver(#[from] DriveError),
    #[error("max retries ({max}) exceeded: {source}")]
    RetriesExhausted {
        max: u32,
        #[source]
        source: DriveError,
    },
    #[error("failed to load PRD: {0}")]
    Prd(anyhow::Error),
}

/// Outcome of one iteration.
#[derive(Debug, Clone, Copy, Default)]
struct IterationOutcome {
    /// The model emitted the completion marker.
    completed: bool,
    /// The iteration was cancelled by stop or context cancellation.
    cancelled: bool,
}

impl IterationOutcome {
    fn cancelled() -> Self {
        IterationOutcome {
            completed: false,
            cancelled: true,
        }
    }
}

/// The agent loop for a single PRD.
pub struct Loop {
    prd_path: PathBuf,
    prompt: String,
    client: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,

    work_dir: Mutex<Option<PathBuf>>,
    store: Mutex<Option<Arc<Store>>>,
    repo_url: Mutex<Option<String>>,
    retry: Mutex<RetryConfig>,

    max_iter: AtomicU32,
    iteration: AtomicU32,
    stopped: AtomicBool,
    paused: AtomicBool,

    /// Cancels the in-flight iteration; present only while one runs.
    iter_cancel: Mutex<Option<CancellationToken>>,
    /// Cancelled once by `stop`, aborting retry back-off waits.
    stop_token: CancellationToken,

    events_tx: mpsc::Sender<AgentEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<AgentEvent>>>,
}

impl Loop {
    /// Create a loop for a PRD file, using the embedded prompt template.
    pub fn new(
        prd_path: PathBuf,
        max_iter: u32,
        client: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let prompt = prompt::agent_prompt(&prd_path);
        Self::with_prompt(prd_path, prompt, max_iter, client, tools)
    }

    /// Create a loop with a caller-supplied prompt.
    pub fn with_prompt(
        prd_path: PathBuf,
        prompt: String,
        max_iter: u32,
        client: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Loop {
            prd_path,
            prompt,
            client,
            tools,
            work_dir: Mutex::new(None),
            store: Mutex::new(None),
            repo_url: Mutex::new(None),
            retry: Mutex::new(RetryConfig::default()),
            max_iter: AtomicU32::new(max_iter),
            iteration: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            iter_cancel: Mutex::new(None),
            stop_token: CancellationToken::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Take the event receiver. Single consumer; returns `None` after the
    /// first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    pub fn set_store(&self, store: Arc<Store>) {
        *self.store.lock().unwrap() = Some(store);
    }

    pub fn set_repo_url(&self, url: impl Into<String>) {
        *self.repo_url.lock().unwrap() = Some(url.into());
    }

    /// Override the working directory (the worktree path, when one exists).
    /// Defaults to the PRD file's directory.
    pub fn set_work_dir(&self, dir: PathBuf) {
        *self.work_dir.lock().unwrap() = Some(dir);
    }

    pub fn set_max_iterations(&self, max_iter: u32) {
        self.max_iter.store(max_iter, Ordering::SeqCst);
    }

    pub fn set_retry_config(&self, config: RetryConfig) {
        *self.retry.lock().unwrap() = config;
    }

    pub fn disable_retry(&self) {
        self.retry.lock().unwrap().enabled = false;
    }

    /// The current iteration number, stable across retries.
    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether an iteration is currently executing.
    pub fn is_running(&self) -> bool {
        self.iter_cancel.lock().unwrap().is_some()
    }

    /// Stop the loop and cancel the in-flight iteration, including any
    /// running LLM stream or tool subprocess.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_token.cancel();
        if let Some(token) = self.iter_cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Request a pause. Takes effect after the current iteration completes;
    /// in-flight work is not cancelled.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clear the pause flag before resuming.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// The directory tools execute in.
    pub fn effective_work_dir(&self) -> PathBuf {
        if let Some(dir) = self.work_dir.lock().unwrap().clone() {
            return dir;
        }
        self.prd_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// The PRD name: the name of the directory holding the PRD file.
    fn prd_name(&self) -> String {
        self.prd_path
            .parent()
            .and_then(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn store_handle(&self) -> Option<Arc<Store>> {
        self.store.lock().unwrap().clone()
    }

    async fn emit(&self, event: AgentEvent) {
        // A dropped receiver means nobody is listening anymore; keep going.
        let _ = self.events_tx.send(event).await;
    }

    /// Run the loop until completion, stop, pause, error, or the iteration
    /// cap. Cancelling `ctx` behaves like `stop`.
    pub async fn run(&self, ctx: CancellationToken) -> Result<LoopTermination, LoopError> {
        let prd_dir = self
            .prd_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let log_path = prd_dir.join(paths::AGENT_LOG_FILE);
        let mut log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(LoopError::LogFile)?;

        loop {
            if self.is_stopped() || ctx.is_cancelled() {
                return Ok(LoopTermination::Stopped);
            }
            if self.is_paused() {
                return Ok(LoopTermination::Paused);
            }

            let current = self.iteration.load(Ordering::SeqCst) + 1;
            if current > self.max_iter.load(Ordering::SeqCst) {
                self.emit(AgentEvent::MaxIterationsReached {
                    iteration: current - 1,
                })
                .await;
                return Ok(LoopTermination::MaxIterationsReached);
            }
            self.iteration.store(current, Ordering::SeqCst);

            self.emit(AgentEvent::IterationStart { iteration: current })
                .await;

            // Snapshot per-story passes before the iteration so newly
            // completed stories can be detected afterwards.
            let pre_pass: HashMap<String, bool> = match self.load_prd().await {
                Ok(prd) => prd
                    .user_stories
                    .iter()
                    .map(|s| (s.id.clone(), s.passes))
                    .collect(),
                Err(_) => HashMap::new(),
            };

            let outcome = match self
                .run_iteration_with_retry(&ctx, current, &mut log_file)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.emit(AgentEvent::Error {
                        iteration: current,
                        message: err.to_string(),
                        terminal: true,
                    })
                    .await;
                    return Err(err);
                }
            };

            if outcome.cancelled {
                return Ok(LoopTermination::Stopped);
            }

            // Reconcile: the file is authoritative for spec fields and now
            // also carries whatever progress the model wrote; sync it in.
            match Prd::load(&self.prd_path) {
                Ok(file_prd) => {
                    self.sync_to_store(&file_prd).await;
                    self.auto_push_if_story_completed(current, &file_prd, &pre_pass)
                        .await;
                }
                Err(err) => {
                    tracing::warn!(prd = %self.prd_path.display(), error = %err, "failed to reload PRD after iteration");
                }
            }

            if self.is_stopped() || ctx.is_cancelled() {
                return Ok(LoopTermination::Stopped);
            }

            let prd = match self.load_prd().await {
                Ok(prd) => prd,
                Err(err) => {
                    self.emit(AgentEvent::Error {
                        iteration: current,
                        message: format!("failed to load PRD: {}", err),
                        terminal: true,
                    })
                    .await;
                    return Err(LoopError::Prd(err));
                }
            };

            if outcome.completed || prd.all_complete() {
                self.emit(AgentEvent::Complete { iteration: current }).await;
                return Ok(LoopTermination::Complete);
            }

            if self.is_paused() {
                return Ok(LoopTermination::Paused);
            }
        }
    }

    /// Run one iteration, retrying failures per the retry config.
    ///
    /// Context cancellation and explicit stop are never retried; errors the
    /// transport classifies as non-retryable surface immediately.
    async fn run_iteration_with_retry(
        &self,
        ctx: &CancellationToken,
        iteration: u32,
        log_file: &mut tokio::fs::File,
    ) -> Result<IterationOutcome, LoopError> {
        let config = self.retry.lock().unwrap().clone();

        let mut last_err: Option<DriveError> = None;
        for attempt in 0..=config.max_retries {
            if attempt > 0 {
                if !config.enabled {
                    // Unreachable without a prior error.
                    return Err(LoopError::Driver(last_err.take().unwrap_or(
                        DriveError::Cancelled,
                    )));
                }

                let delay_idx = ((attempt - 1) as usize).min(config.retry_delays.len().saturating_sub(1));
                let delay = config
                    .retry_delays
                    .get(delay_idx)
                    .copied()
                    .unwrap_or(Duration::ZERO);

                self.emit(AgentEvent::Retrying {
                    iteration,
                    attempt,
                    max_attempts: config.max_retries,
                })
                .await;

                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancelled() => return Ok(IterationOutcome::cancelled()),
                        _ = self.stop_token.cancelled() => return Ok(IterationOutcome::cancelled()),
                    }
                }
            }

            if self.is_stopped() {
                return Ok(IterationOutcome::cancelled());
            }

            match self.run_iteration(ctx, iteration, log_file).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    if ctx.is_cancelled() || self.is_stopped() {
                        return Ok(IterationOutcome::cancelled());
                    }
                    if !err.is_retryable() {
                        return Err(LoopError::Driver(err));
                    }
                    tracing::warn!(iteration, attempt, error = %err, "iteration failed, will retry");
                    last_err = Some(err);
                }
            }
        }

        Err(LoopError::RetriesExhausted {
            max: config.max_retries,
            source: last_err.unwrap_or(DriveError::Cancelled),
        })
    }

    /// Run a single agent iteration, forwarding driver events.
    async fn run_iteration(
        &self,
        ctx: &CancellationToken,
        iteration: u32,
        log_file: &mut tokio::fs::File,
    ) -> Result<IterationOutcome, DriveError> {
        let iter_token = ctx.child_token();
        *self.iter_cancel.lock().unwrap() = Some(iter_token.clone());

        let result = self
            .iteration_events(&iter_token, iteration, log_file)
            .await;

        iter_token.cancel();
        *self.iter_cancel.lock().unwrap() = None;
        result
    }

    async fn iteration_events(
        &self,
        iter_token: &CancellationToken,
        iteration: u32,
        log_file: &mut tokio::fs::File,
    ) -> Result<IterationOutcome, DriveError> {
        let messages = vec![ChatMessage::new(Role::User, self.prompt.clone())];
        let opts = AgentOptions::new(self.effective_work_dir());

        let mut stream = run_agent(
            iter_token.clone(),
            self.client.clone(),
            self.tools.clone(),
            messages,
            opts,
        );

        while let Some(event) = stream.recv().await {
            match event {
                DriverEvent::TextDelta(text) => {
                    log_line(log_file, &text).await;

                    if prompt::contains_complete(&text) {
                        return Ok(IterationOutcome {
                            completed: true,
                            cancelled: false,
                        });
                    }

                    if let Some(story_id) = prompt::extract_story_id(&text) {
                        self.emit(AgentEvent::StoryStarted {
                            iteration,
                            story_id,
                            text,
                        })
                        .await;
                    } else {
                        self.emit(AgentEvent::AssistantText { iteration, text })
                            .await;
                    }
                }
                DriverEvent::ToolStart { name, input } => {
                    log_line(
                        log_file,
                        &format!("[tool] {} {}", name, serde_json::Value::Object(input.clone())),
                    )
                    .await;
                    self.emit(AgentEvent::ToolStart {
                        iteration,
                        tool: name,
                        input,
                    })
                    .await;
                }
                DriverEvent::ToolResult(text) => {
                    log_line(log_file, &format!("[tool_result] {}", text)).await;
                    self.emit(AgentEvent::ToolResult { iteration, text }).await;
                }
                DriverEvent::Done => {}
                DriverEvent::Error(DriveError::Cancelled) => {
                    return Ok(IterationOutcome::cancelled());
                }
                DriverEvent::Error(err) => {
                    if self.is_stopped() || iter_token.is_cancelled() {
                        return Ok(IterationOutcome::cancelled());
                    }
                    return Err(err);
                }
            }
        }

        Ok(IterationOutcome::default())
    }

    /// Load the PRD: file first, then overlay stored progress per story id.
    async fn load_prd(&self) -> anyhow::Result<Prd> {
        let mut prd = Prd::load(&self.prd_path)?;
        if let Some(store) = self.store_handle() {
            if let Ok(Some(project_id)) = store.get_project_id(&self.prd_name()).await {
                match store.get_progress(project_id).await {
                    Ok(progress) => prd.overlay_progress(&progress),
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to read stored progress");
                    }
                }
            }
        }
        Ok(prd)
    }

    /// Upsert the project and every story into the store.
    ///
    /// Store failures are logged; the loop keeps running off the file.
    async fn sync_to_store(&self, prd: &Prd) {
        let Some(store) = self.store_handle() else {
            return;
        };
        let name = self.prd_name();
        let repo_url = self.repo_url.lock().unwrap().clone();

        match store
            .save_project(&name, &prd.project, &prd.description, repo_url.as_deref())
            .await
        {
            Ok(project_id) => {
                for story in &prd.user_stories {
                    if let Err(err) = store.save_story(project_id, &story.into()).await {
                        tracing::warn!(story = %story.id, error = %err, "failed to save story");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(project = %name, error = %err, "failed to save project");
            }
        }
    }

    /// Commit and push when the iteration produced newly passing stories.
    ///
    /// Best-effort: failures surface as a non-terminal `Error` event and
    /// the loop continues.
    async fn auto_push_if_story_completed(
        &self,
        iteration: u32,
        prd: &Prd,
        pre_pass: &HashMap<String, bool>,
    ) {
        let work_dir = self.effective_work_dir();
        if !crate::git::is_git_repo(&work_dir).await {
            return;
        }

        let completed: Vec<String> = prd
            .user_stories
            .iter()
            .filter(|s| s.passes && !pre_pass.get(&s.id).copied().unwrap_or(false))
            .map(|s| format!("{}: {}", s.id, s.title))
            .collect();
        if completed.is_empty() {
            return;
        }

        let branch = match crate::git::current_branch(&work_dir).await {
            Ok(branch) if !branch.is_empty() => branch,
            _ => return,
        };

        let mut message = format!("feat: complete {}", completed.join(", "));
        if message.len() > MAX_COMMIT_SUBJECT {
            message = format!("feat: complete {} stories", completed.len());
        }

        self.emit(AgentEvent::AssistantText {
            iteration,
            text: format!("Auto-pushing completed stories to {}...", branch),
        })
        .await;

        match crate::git::commit_and_push(&work_dir, &branch, &message).await {
            Ok(()) => {
                self.emit(AgentEvent::AssistantText {
                    iteration,
                    text: format!("Pushed: {}", message),
                })
                .await;
            }
            Err(err) => {
                self.emit(AgentEvent::Error {
                    iteration,
                    message: format!("auto-push failed: {}", err),
                    terminal: false,
                })
                .await;
            }
        }
    }
}

/// Append one line to the per-PRD log file, best-effort.
async fn log_line(file: &mut tokio::fs::File, line: &str) {
    let _ = file.write_all(line.as_bytes()).await;
    let _ = file.write_all(b"\n").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::test_support::{tool_call, ScriptedClient, ScriptedTurn, TestRepo};
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;

    /// Write a PRD file with deterministic formatting so scripted `edit`
    /// tool calls can match exact substrings.
    fn write_prd(dir: &Path, project: &str, stories: &[(&str, &str, i64, bool)]) -> PathBuf {
        let stories_json: Vec<serde_json::Value> = stories
            .iter()
            .map(|(id, title, priority, passes)| {
                json!({
                    "id": id,
                    "title": title,
                    "description": "",
                    "acceptanceCriteria": [],
                    "priority": priority,
                    "passes": passes,
                    "inProgress": false
                })
            })
            .collect();
        let prd = json!({
            "project": project,
            "description": "",
            "userStories": stories_json
        });
        let path = dir.join("prd.json");
        let mut data = serde_json::to_string_pretty(&prd).unwrap();
        data.push('\n');
        std::fs::write(&path, data).unwrap();
        path
    }

    fn passes_edit_call(id: &str, prd_path: &Path) -> crate::llm::ToolCall {
        // The pretty-printed story block contains `"passes": false` once
        // per story; scope the match with the story id.
        tool_call(
            "c-edit",
            "edit",
            json!({
                "file_path": prd_path.to_string_lossy(),
                "old_string": format!("\"id\": \"{}\",\n      \"inProgress\": false,\n      \"passes\": false", id),
                "new_string": format!("\"id\": \"{}\",\n      \"inProgress\": false,\n      \"passes\": true", id),
            }),
        )
    }

    fn new_loop(
        prd_path: &Path,
        max_iter: u32,
        turns: Vec<ScriptedTurn>,
    ) -> (Arc<Loop>, mpsc::Receiver<AgentEvent>) {
        let client = Arc::new(ScriptedClient::new(turns));
        let agent_loop = Arc::new(Loop::new(
            prd_path.to_path_buf(),
            max_iter,
            client,
            Arc::new(ToolRegistry::standard()),
        ));
        let events = agent_loop.take_events().unwrap();
        (agent_loop, events)
    }

    /// Collect everything already buffered on the channel. Callers invoke
    /// this after the loop returned, so no further events can arrive.
    async fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(250), rx.recv()).await
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_single_story_happy_path() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(temp.path(), "Auth", &[("US-1", "Login", 1, false)]);

        let (agent_loop, events_rx) = new_loop(
            &prd_path,
            10,
            vec![
                ScriptedTurn::text(&["Marking the story as passing"]).with_tool_calls(vec![
                    passes_edit_call("US-1", &prd_path),
                ]),
                ScriptedTurn::text(&["<complete/>"]),
            ],
        );
        let store = Arc::new(Store::in_memory().unwrap());
        agent_loop.set_store(store.clone());

        let termination = agent_loop.run(CancellationToken::new()).await.unwrap();
        assert_eq!(termination, LoopTermination::Complete);

        let events = drain(events_rx).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "IterationStart",
                "AssistantText",
                "ToolStart",
                "ToolResult",
                "Complete"
            ]
        );

        // The store reconciled the file's progress.
        let prd_name = temp.path().file_name().unwrap().to_string_lossy();
        let project_id = store.get_project_id(&prd_name).await.unwrap().unwrap();
        let stories = store.get_stories(project_id).await.unwrap();
        assert_eq!(stories.len(), 1);
        assert!(stories[0].passes);

        // The per-PRD log captured the deltas.
        let log = std::fs::read_to_string(temp.path().join(paths::AGENT_LOG_FILE)).unwrap();
        assert!(log.contains("Marking the story as passing"));
        assert!(log.contains("[tool] edit"));
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(temp.path(), "Auth", &[("US-1", "Login", 1, false)]);

        let (agent_loop, events_rx) = new_loop(
            &prd_path,
            10,
            vec![
                ScriptedTurn::error(LlmError::from_status(502, "bad gateway")),
                ScriptedTurn::text(&["<complete/>"]),
            ],
        );

        let termination = agent_loop.run(CancellationToken::new()).await.unwrap();
        assert_eq!(termination, LoopTermination::Complete);

        let events = drain(events_rx).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["IterationStart", "Retrying", "Complete"]);
        match &events[1] {
            AgentEvent::Retrying {
                iteration,
                attempt,
                max_attempts,
            } => {
                assert_eq!(*iteration, 1);
                assert_eq!(*attempt, 1);
                assert_eq!(*max_attempts, 3);
            }
            other => panic!("expected Retrying, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_surfaces_immediately() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(temp.path(), "Auth", &[("US-1", "Login", 1, false)]);

        let (agent_loop, events_rx) = new_loop(
            &prd_path,
            10,
            vec![ScriptedTurn::error(LlmError::from_status(401, "bad key"))],
        );

        let err = agent_loop.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LoopError::Driver(DriveError::Llm(_))));

        let events = drain(events_rx).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["IterationStart", "Error"]);
        match &events[1] {
            AgentEvent::Error { terminal, .. } => assert!(*terminal),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(temp.path(), "Auth", &[("US-1", "Login", 1, false)]);

        let (agent_loop, events_rx) = new_loop(
            &prd_path,
            10,
            (0..4)
                .map(|_| ScriptedTurn::error(LlmError::from_status(503, "unavailable")))
                .collect(),
        );
        agent_loop.set_retry_config(RetryConfig {
            max_retries: 3,
            retry_delays: vec![Duration::ZERO],
            enabled: true,
        });

        let err = agent_loop.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LoopError::RetriesExhausted { max: 3, .. }));

        let events = drain(events_rx).await;
        let retrying = events.iter().filter(|e| e.kind() == "Retrying").count();
        assert_eq!(retrying, 3);
        assert_eq!(events.last().unwrap().kind(), "Error");
    }

    #[tokio::test]
    async fn test_max_iterations_zero_is_immediate() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(temp.path(), "Auth", &[("US-1", "Login", 1, false)]);

        let (agent_loop, events_rx) = new_loop(&prd_path, 0, vec![]);
        let termination = agent_loop.run(CancellationToken::new()).await.unwrap();
        assert_eq!(termination, LoopTermination::MaxIterationsReached);

        let events = drain(events_rx).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentEvent::MaxIterationsReached { iteration } => assert_eq!(*iteration, 0),
            other => panic!("expected MaxIterationsReached, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_stories_completes_on_first_iteration() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(temp.path(), "Empty", &[]);

        let (agent_loop, events_rx) = new_loop(
            &prd_path,
            10,
            vec![ScriptedTurn::text(&["nothing to do"])],
        );
        let termination = agent_loop.run(CancellationToken::new()).await.unwrap();
        assert_eq!(termination, LoopTermination::Complete);

        let events = drain(events_rx).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["IterationStart", "AssistantText", "Complete"]);
    }

    #[tokio::test]
    async fn test_story_marker_replaces_assistant_text() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(temp.path(), "Auth", &[("US-1", "Login", 1, false)]);

        let (agent_loop, events_rx) = new_loop(
            &prd_path,
            1,
            vec![ScriptedTurn::text(&["<status>US-1</status>", "implementing"])],
        );
        let termination = agent_loop.run(CancellationToken::new()).await.unwrap();
        assert_eq!(termination, LoopTermination::MaxIterationsReached);

        let events = drain(events_rx).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "IterationStart",
                "StoryStarted",
                "AssistantText",
                "MaxIterationsReached"
            ]
        );
        match &events[1] {
            AgentEvent::StoryStarted { story_id, .. } => assert_eq!(story_id, "US-1"),
            other => panic!("expected StoryStarted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_story_selection_follows_priority_order() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(
            temp.path(),
            "Shop",
            &[
                ("US-A", "Checkout", 3, false),
                ("US-B", "Catalog", 1, false),
                ("US-C", "Cart", 2, false),
            ],
        );

        // One story per iteration, announced in ascending priority order,
        // finishing with the completion marker.
        let (agent_loop, events_rx) = new_loop(
            &prd_path,
            10,
            vec![
                ScriptedTurn::text(&["<status>US-B</status>"]),
                ScriptedTurn::text(&["<status>US-C</status>"]),
                ScriptedTurn::text(&["<status>US-A</status>"]),
                ScriptedTurn::text(&["<complete/>"]),
            ],
        );

        let termination = agent_loop.run(CancellationToken::new()).await.unwrap();
        assert_eq!(termination, LoopTermination::Complete);

        let events = drain(events_rx).await;
        let started: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::StoryStarted { story_id, .. } => Some(story_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["US-B", "US-C", "US-A"]);
        assert_eq!(events.last().unwrap().kind(), "Complete");
    }

    #[tokio::test]
    async fn test_stop_during_retry_backoff() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(temp.path(), "Auth", &[("US-1", "Login", 1, false)]);

        let (agent_loop, events_rx) = new_loop(
            &prd_path,
            10,
            vec![ScriptedTurn::error(LlmError::from_status(503, "down"))],
        );
        agent_loop.set_retry_config(RetryConfig {
            max_retries: 3,
            retry_delays: vec![Duration::from_secs(60)],
            enabled: true,
        });

        let handle = {
            let agent_loop = agent_loop.clone();
            tokio::spawn(async move { agent_loop.run(CancellationToken::new()).await })
        };

        // Wait for the Retrying event, then stop during the back-off wait.
        let mut rx = events_rx;
        let started = std::time::Instant::now();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event before timeout")
            {
                Some(AgentEvent::Retrying { .. }) => break,
                Some(_) => continue,
                None => panic!("channel closed before Retrying"),
            }
        }
        agent_loop.stop();

        let termination = handle.await.unwrap().unwrap();
        assert_eq!(termination, LoopTermination::Stopped);
        assert!(started.elapsed() < Duration::from_secs(30));

        let events = drain(rx).await;
        assert!(events.iter().all(|e| e.kind() != "Error"));
    }

    #[tokio::test]
    async fn test_pause_takes_effect_after_iteration() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(temp.path(), "Auth", &[("US-1", "Login", 1, false)]);

        let (agent_loop, mut events_rx) = new_loop(
            &prd_path,
            10,
            vec![
                ScriptedTurn::text(&["iteration one"]).with_tool_calls(vec![tool_call(
                    "c1",
                    "bash",
                    json!({"command": "sleep 0.5"}),
                )]),
                // Ends iteration 1 without tools and without completing.
                ScriptedTurn::text(&["iteration one finished"]),
                ScriptedTurn::text(&["<complete/>"]),
            ],
        );

        let handle = {
            let agent_loop = agent_loop.clone();
            tokio::spawn(async move { agent_loop.run(CancellationToken::new()).await })
        };

        // Pause while the first iteration's tool runs.
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
                .await
                .expect("event before timeout")
            {
                Some(AgentEvent::ToolStart { .. }) => break,
                Some(_) => continue,
                None => panic!("channel closed early"),
            }
        }
        agent_loop.pause();

        let termination = handle.await.unwrap().unwrap();
        assert_eq!(termination, LoopTermination::Paused);
        assert_eq!(agent_loop.iteration(), 1);

        // No second iteration started.
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await
        {
            assert_ne!(event.kind(), "IterationStart");
        }

        // Resume: iteration 2 runs and completes.
        agent_loop.resume();
        let termination = agent_loop.run(CancellationToken::new()).await.unwrap();
        assert_eq!(termination, LoopTermination::Complete);

        let events = drain(events_rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::IterationStart { iteration: 2 })));
        assert!(events.iter().any(|e| e.kind() == "Complete"));
    }

    #[tokio::test]
    async fn test_stop_mid_iteration_cancels_tool() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(temp.path(), "Auth", &[("US-1", "Login", 1, false)]);

        let (agent_loop, mut events_rx) = new_loop(
            &prd_path,
            10,
            vec![ScriptedTurn::text(&["long running"]).with_tool_calls(vec![tool_call(
                "c1",
                "bash",
                json!({"command": "sleep 30"}),
            )])],
        );

        let handle = {
            let agent_loop = agent_loop.clone();
            tokio::spawn(async move { agent_loop.run(CancellationToken::new()).await })
        };

        loop {
            match tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
                .await
                .expect("event before timeout")
            {
                Some(AgentEvent::ToolStart { .. }) => break,
                Some(_) => continue,
                None => panic!("channel closed early"),
            }
        }

        let started = std::time::Instant::now();
        agent_loop.stop();
        let termination = handle.await.unwrap().unwrap();
        assert_eq!(termination, LoopTermination::Stopped);
        assert!(started.elapsed() < Duration::from_secs(10));

        let events = drain(events_rx).await;
        assert!(events.iter().all(|e| e.kind() != "Error"));
        assert!(agent_loop.is_stopped());
    }

    #[tokio::test]
    async fn test_auto_commit_on_story_completion() {
        let repo = TestRepo::new();
        let prd_dir = repo.path().join(".foreman/prds/auth");
        std::fs::create_dir_all(&prd_dir).unwrap();
        let prd_path = write_prd(&prd_dir, "Auth", &[("US-1", "Login", 1, false)]);

        let (agent_loop, events_rx) = new_loop(
            &prd_path,
            10,
            vec![
                ScriptedTurn::text(&["done editing"]).with_tool_calls(vec![
                    tool_call(
                        "c1",
                        "write",
                        json!({"file_path": "login.rs", "content": "// login"}),
                    ),
                    passes_edit_call("US-1", &prd_path),
                ]),
                ScriptedTurn::text(&["<complete/>"]),
            ],
        );
        agent_loop.set_work_dir(repo.path().to_path_buf());

        let termination = agent_loop.run(CancellationToken::new()).await.unwrap();
        assert_eq!(termination, LoopTermination::Complete);

        // The commit landed even though the push failed (no remote).
        let log = std::process::Command::new("git")
            .args(["log", "--oneline"])
            .current_dir(repo.path())
            .output()
            .unwrap();
        let log = String::from_utf8_lossy(&log.stdout).to_string();
        assert!(log.contains("feat: complete US-1: Login"));

        let events = drain(events_rx).await;
        // Push failure is surfaced as a non-terminal error, then Complete.
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::Error { terminal: false, message, .. } if message.contains("auto-push")
        )));
        assert_eq!(events.last().unwrap().kind(), "Complete");
    }

    #[tokio::test]
    async fn test_parallel_worktrees_stay_isolated() {
        let repo = TestRepo::new();
        let config = crate::config::Config::default();

        let mut loops = Vec::new();
        for name in ["auth", "payments"] {
            let prd_dir = repo.path().join(".foreman/prds").join(name);
            std::fs::create_dir_all(&prd_dir).unwrap();
            let prd_path = write_prd(&prd_dir, name, &[("US-1", "Only story", 1, false)]);

            let (worktree, branch) = crate::git::worktree::ensure_for_prd(
                repo.path(),
                repo.path(),
                name,
                None,
                &config,
            )
            .await
            .unwrap();
            assert_eq!(branch, format!("foreman/{}", name));

            let (agent_loop, events_rx) = new_loop(
                &prd_path,
                10,
                vec![
                    ScriptedTurn::text(&["implementing"]).with_tool_calls(vec![
                        tool_call(
                            "c1",
                            "write",
                            json!({
                                "file_path": format!("{}.rs", name),
                                "content": format!("// {}\n", name)
                            }),
                        ),
                        passes_edit_call("US-1", &prd_path),
                    ]),
                    ScriptedTurn::text(&["<complete/>"]),
                ],
            );
            agent_loop.set_work_dir(worktree.clone());
            loops.push((name, worktree, agent_loop, events_rx));
        }

        // Run both loops concurrently.
        let handles: Vec<_> = loops
            .iter()
            .map(|(_, _, agent_loop, _)| {
                let agent_loop = agent_loop.clone();
                tokio::spawn(async move { agent_loop.run(CancellationToken::new()).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), LoopTermination::Complete);
        }

        // Each worktree holds only its own file.
        let auth_wt = &loops[0].1;
        let pay_wt = &loops[1].1;
        assert!(auth_wt.join("auth.rs").exists());
        assert!(!auth_wt.join("payments.rs").exists());
        assert!(pay_wt.join("payments.rs").exists());
        assert!(!pay_wt.join("auth.rs").exists());

        // Both branches merge cleanly into the default branch.
        for branch in ["foreman/auth", "foreman/payments"] {
            let conflicts = crate::git::merge_branch(repo.path(), branch).await.unwrap();
            assert!(conflicts.is_empty(), "unexpected conflicts on {}", branch);
        }
        assert!(repo.path().join("auth.rs").exists());
        assert!(repo.path().join("payments.rs").exists());
    }

    #[tokio::test]
    async fn test_store_overlay_round_trip() {
        let temp = tempdir().unwrap();
        let prd_path = write_prd(
            temp.path(),
            "Auth",
            &[("US-1", "Login", 1, false), ("US-2", "Logout", 2, false)],
        );

        let store = Arc::new(Store::in_memory().unwrap());
        let (agent_loop, events_rx) = new_loop(
            &prd_path,
            1,
            vec![ScriptedTurn::text(&["worked"]).with_tool_calls(vec![passes_edit_call(
                "US-1", &prd_path,
            )])],
        );
        agent_loop.set_store(store.clone());

        // One iteration, not complete (US-2 still open).
        let termination = agent_loop.run(CancellationToken::new()).await.unwrap();
        assert_eq!(termination, LoopTermination::MaxIterationsReached);
        drop(events_rx);

        // File → store → overlay agrees with the file's progress.
        let loaded = agent_loop.load_prd().await.unwrap();
        assert!(loaded.user_stories.iter().any(|s| s.id == "US-1" && s.passes));
        assert!(loaded.user_stories.iter().any(|s| s.id == "US-2" && !s.passes));
    }
}
