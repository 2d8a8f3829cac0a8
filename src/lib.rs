//! # Foreman
//!
//! An autonomous code-synthesis orchestrator. A product-requirements
//! document (PRD) is decomposed into prioritized user stories; Foreman
//! drives an LLM coding agent through a bounded iterative loop until every
//! story passes, committing intermediate work to an isolated branch of the
//! target repository.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │             Manager              │
//!        │   (N concurrent loops, fan-in)   │
//!        └────────────────┬─────────────────┘
//!                         │ per PRD
//!                         ▼
//!        ┌──────────────────────────────────┐
//!        │            Loop engine           │
//!        │  iterate → reconcile → commit    │
//!        └───────┬──────────────┬───────────┘
//!                │              │
//!                ▼              ▼
//!        ┌──────────────┐ ┌──────────────┐
//!        │ Agent driver │ │  PRD store   │
//!        │ (chat ⇄ tool)│ │  (SQLite)    │
//!        └──────────────┘ └──────────────┘
//! ```
//!
//! ## Modules
//! - `llm`: chat/tool-call contract and the streaming LLM client
//! - `tools`: filesystem and shell tools the agent can invoke
//! - `agent`: single-turn driver interleaving chat turns and tool execution
//! - `prd`: PRD document model and progress merge policy
//! - `store`: embedded SQLite store for projects, stories, and logs
//! - `git`: git plumbing and the per-PRD worktree lifecycle
//! - `engine`: the per-PRD loop and the multi-PRD manager

pub mod agent;
pub mod config;
pub mod engine;
pub mod git;
pub mod llm;
pub mod paths;
pub mod prd;
pub mod prompt;
pub mod store;
pub mod tools;

#[cfg(test)]
pub mod test_support;

pub use engine::{AgentEvent, Loop, LoopState, Manager};
pub use prd::Prd;
pub use store::Store;
