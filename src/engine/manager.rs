//! Supervisor for many concurrent agent loops.
//!
//! The manager owns one `LoopInstance` per registered PRD, spawns a task
//! per started loop, and multiplexes every loop's events onto a single
//! `(prd_name, event)` channel. It never reaches into a loop's internals:
//! it sends control calls and observes events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::agent_loop::{Loop, LoopTermination};
use super::event::AgentEvent;
use crate::llm::LlmClient;
use crate::paths;
use crate::store::Store;
use crate::tools::ToolRegistry;

/// Default iteration cap for newly registered loops.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Buffer size of the fan-in event channel.
const FAN_IN_BUFFER: usize = 256;

/// Lifecycle state of a registered loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Ready,
    Running,
    Paused,
    Stopped,
    Complete,
    Error,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopState::Ready => "ready",
            LoopState::Running => "running",
            LoopState::Paused => "paused",
            LoopState::Stopped => "stopped",
            LoopState::Complete => "complete",
            LoopState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of a loop's state for callers.
#[derive(Debug, Clone)]
pub struct LoopStatus {
    pub state: LoopState,
    pub iteration: u32,
    pub last_error: Option<String>,
}

/// Errors from manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("no loop registered for '{0}'")]
    NotFound(String),
    #[error("'{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("invalid PRD name '{0}'")]
    InvalidName(String),
    #[error("cannot {op} '{name}' while {state}")]
    InvalidState {
        name: String,
        state: LoopState,
        op: &'static str,
    },
}

struct InstanceStatus {
    state: LoopState,
    last_error: Option<String>,
}

struct LoopInstance {
    prd_path: PathBuf,
    worktree_path: Option<PathBuf>,
    branch: Option<String>,
    repo_url: Option<String>,
    agent_loop: Arc<Loop>,
    status: Arc<std::sync::Mutex<InstanceStatus>>,
    run_cancel: Option<CancellationToken>,
    forwarder_started: bool,
}

/// Supervises N concurrent loops and fans their events into one channel.
pub struct Manager {
    instances: Mutex<HashMap<String, LoopInstance>>,
    max_iterations: AtomicU32,
    client: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    store: std::sync::Mutex<Option<Arc<Store>>>,
    events_tx: mpsc::Sender<(String, AgentEvent)>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<(String, AgentEvent)>>>,
}

impl Manager {
    /// Create a manager. Loops registered later share the given client.
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(FAN_IN_BUFFER);
        Manager {
            instances: Mutex::new(HashMap::new()),
            max_iterations: AtomicU32::new(DEFAULT_MAX_ITERATIONS),
            client,
            tools: Arc::new(ToolRegistry::standard()),
            store: std::sync::Mutex::new(None),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        }
    }

    /// Attach a store; loops registered afterwards reconcile into it.
    pub fn set_store(&self, store: Arc<Store>) {
        *self.store.lock().unwrap() = Some(store);
    }

    /// The fan-in event channel: `(prd_name, event)` pairs from every loop.
    ///
    /// Single consumer; panics when taken twice.
    pub fn events(&self) -> mpsc::Receiver<(String, AgentEvent)> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .expect("Manager::events may only be taken once")
    }

    /// Register a PRD without worktree isolation; tools run in the PRD's
    /// directory.
    pub async fn register(&self, name: &str, prd_path: PathBuf) -> Result<(), ManagerError> {
        self.register_inner(name, prd_path, None, None, None).await
    }

    /// Register a PRD whose loop runs inside a git worktree.
    pub async fn register_with_worktree(
        &self,
        name: &str,
        prd_path: PathBuf,
        repo_url: Option<String>,
        worktree_path: PathBuf,
        branch: String,
    ) -> Result<(), ManagerError> {
        self.register_inner(name, prd_path, repo_url, Some(worktree_path), Some(branch))
            .await
    }

    async fn register_inner(
        &self,
        name: &str,
        prd_path: PathBuf,
        repo_url: Option<String>,
        worktree_path: Option<PathBuf>,
        branch: Option<String>,
    ) -> Result<(), ManagerError> {
        if !paths::is_valid_prd_name(name) {
            return Err(ManagerError::InvalidName(name.to_string()));
        }

        let mut instances = self.instances.lock().await;
        if instances.contains_key(name) {
            return Err(ManagerError::AlreadyRegistered(name.to_string()));
        }

        let abs_path = prd_path.canonicalize().unwrap_or(prd_path);
        let agent_loop = Arc::new(Loop::new(
            abs_path.clone(),
            self.max_iterations.load(Ordering::SeqCst),
            self.client.clone(),
            self.tools.clone(),
        ));
        if let Some(store) = self.store.lock().unwrap().clone() {
            agent_loop.set_store(store);
        }
        if let Some(url) = repo_url.as_deref() {
            agent_loop.set_repo_url(url);
        }
        if let Some(path) = worktree_path.clone() {
            agent_loop.set_work_dir(path);
        }

        tracing::info!(name, prd = %abs_path.display(), "registered loop");

        instances.insert(
            name.to_string(),
            LoopInstance {
                prd_path: abs_path,
                worktree_path,
                branch,
                repo_url,
                agent_loop,
                status: Arc::new(std::sync::Mutex::new(InstanceStatus {
                    state: LoopState::Ready,
                    last_error: None,
                })),
                run_cancel: None,
                forwarder_started: false,
            },
        );
        Ok(())
    }

    /// Update worktree info on an already registered loop.
    pub async fn update_worktree_info(
        &self,
        name: &str,
        repo_url: Option<String>,
        worktree_path: PathBuf,
        branch: String,
    ) -> Result<(), ManagerError> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        instance.agent_loop.set_work_dir(worktree_path.clone());
        if let Some(url) = repo_url.as_deref() {
            instance.agent_loop.set_repo_url(url);
        }
        instance.worktree_path = Some(worktree_path);
        instance.branch = Some(branch);
        instance.repo_url = repo_url;
        Ok(())
    }

    /// Worktree path and branch for a registered loop, when set.
    pub async fn worktree_info(&self, name: &str) -> Option<(PathBuf, String)> {
        let instances = self.instances.lock().await;
        let instance = instances.get(name)?;
        Some((
            instance.worktree_path.clone()?,
            instance.branch.clone()?,
        ))
    }

    /// The registered PRD file path.
    pub async fn prd_path(&self, name: &str) -> Option<PathBuf> {
        let instances = self.instances.lock().await;
        instances.get(name).map(|i| i.prd_path.clone())
    }

    /// The remote repository URL recorded for a loop, when known.
    pub async fn repo_url(&self, name: &str) -> Option<String> {
        let instances = self.instances.lock().await;
        instances.get(name).and_then(|i| i.repo_url.clone())
    }

    /// Start (or resume) a loop in a background task. Returns immediately.
    pub async fn start(&self, name: &str) -> Result<(), ManagerError> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        let state = instance.status.lock().unwrap().state;
        match state {
            LoopState::Ready | LoopState::Paused | LoopState::Error => {}
            other => {
                return Err(ManagerError::InvalidState {
                    name: name.to_string(),
                    state: other,
                    op: "start",
                });
            }
        }

        // One forwarder per instance, alive for the instance's lifetime;
        // it drains the loop's channel into the fan-in channel.
        if !instance.forwarder_started {
            if let Some(mut rx) = instance.agent_loop.take_events() {
                let events_tx = self.events_tx.clone();
                let store = self.store.lock().unwrap().clone();
                let prd_name = name.to_string();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        if let (Some(store), Some(text)) = (store.as_ref(), event.display_text()) {
                            if let Err(err) = store.append_log(&prd_name, &text).await {
                                tracing::warn!(error = %err, "failed to mirror event into log");
                            }
                        }
                        if events_tx.send((prd_name.clone(), event)).await.is_err() {
                            return;
                        }
                    }
                });
            }
            instance.forwarder_started = true;
        }

        if state == LoopState::Paused {
            instance.agent_loop.resume();
        }

        let cancel = CancellationToken::new();
        instance.run_cancel = Some(cancel.clone());
        {
            let mut status = instance.status.lock().unwrap();
            status.state = LoopState::Running;
            status.last_error = None;
        }

        let agent_loop = instance.agent_loop.clone();
        let status = instance.status.clone();
        let prd_name = name.to_string();
        tokio::spawn(async move {
            let termination = agent_loop.run(cancel).await;
            let mut status = status.lock().unwrap();
            match termination {
                Ok(LoopTermination::Complete) => status.state = LoopState::Complete,
                // The cap is not an error; the loop may be started again.
                Ok(LoopTermination::MaxIterationsReached) => status.state = LoopState::Ready,
                Ok(LoopTermination::Stopped) => status.state = LoopState::Stopped,
                Ok(LoopTermination::Paused) => status.state = LoopState::Paused,
                Err(err) => {
                    tracing::error!(name = %prd_name, error = %err, "loop failed");
                    status.state = LoopState::Error;
                    status.last_error = Some(err.to_string());
                }
            }
        });

        Ok(())
    }

    /// Pause a running loop after its current iteration.
    pub async fn pause(&self, name: &str) -> Result<(), ManagerError> {
        let instances = self.instances.lock().await;
        let instance = instances
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        let state = instance.status.lock().unwrap().state;
        if state != LoopState::Running {
            return Err(ManagerError::InvalidState {
                name: name.to_string(),
                state,
                op: "pause",
            });
        }
        instance.agent_loop.pause();
        Ok(())
    }

    /// Resume a paused loop.
    pub async fn resume(&self, name: &str) -> Result<(), ManagerError> {
        self.start(name).await
    }

    /// Stop a loop, cancelling its in-flight iteration.
    pub async fn stop(&self, name: &str) -> Result<(), ManagerError> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        let state = instance.status.lock().unwrap().state;
        match state {
            LoopState::Running | LoopState::Paused => {}
            other => {
                return Err(ManagerError::InvalidState {
                    name: name.to_string(),
                    state: other,
                    op: "stop",
                });
            }
        }

        instance.agent_loop.stop();
        if let Some(cancel) = instance.run_cancel.take() {
            cancel.cancel();
        }
        if state == LoopState::Paused {
            // No run task is alive to observe the stop; transition here.
            instance.status.lock().unwrap().state = LoopState::Stopped;
        }
        Ok(())
    }

    /// Stop a loop if needed and drop its registration.
    pub async fn remove(&self, name: &str) -> Result<(), ManagerError> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .remove(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        instance.agent_loop.stop();
        if let Some(cancel) = instance.run_cancel {
            cancel.cancel();
        }
        tracing::info!(name, "removed loop");
        Ok(())
    }

    /// Current state snapshot for a loop.
    pub async fn get_state(&self, name: &str) -> Result<LoopStatus, ManagerError> {
        let instances = self.instances.lock().await;
        let instance = instances
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        let status = instance.status.lock().unwrap();
        Ok(LoopStatus {
            state: status.state,
            iteration: instance.agent_loop.iteration(),
            last_error: status.last_error.clone(),
        })
    }

    /// Registered loop names.
    pub async fn names(&self) -> Vec<String> {
        let instances = self.instances.lock().await;
        let mut names: Vec<String> = instances.keys().cloned().collect();
        names.sort();
        names
    }

    /// The default iteration cap for new registrations.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations.load(Ordering::SeqCst)
    }

    /// Set the default cap and apply it to every registered loop.
    pub async fn set_max_iterations(&self, max_iter: u32) {
        self.max_iterations.store(max_iter, Ordering::SeqCst);
        let instances = self.instances.lock().await;
        for instance in instances.values() {
            instance.agent_loop.set_max_iterations(max_iter);
        }
    }

    /// Set the cap for one loop only.
    pub async fn set_max_iterations_for_instance(
        &self,
        name: &str,
        max_iter: u32,
    ) -> Result<(), ManagerError> {
        let instances = self.instances.lock().await;
        let instance = instances
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        instance.agent_loop.set_max_iterations(max_iter);
        Ok(())
    }
}
