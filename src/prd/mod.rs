//! PRD document model and file IO.
//!
//! The on-disk `prd.json` is the source of truth for specification fields
//! (ids, titles, criteria, priorities); the store overlays progress fields
//! (`passes`, `inProgress`). Unknown JSON fields are preserved on write.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A single acceptance-tested work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Lower numbers are worked first.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub in_progress: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A product-requirements document: a project header plus ordered stories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    pub project: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub user_stories: Vec<UserStory>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Prd {
    /// Load a PRD from a JSON file.
    pub fn load(path: &Path) -> Result<Prd> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read PRD file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("failed to parse PRD file {}", path.display()))
    }

    /// Write a PRD as 2-space-indented JSON with a trailing newline.
    ///
    /// Stories keep the order they appear in; it is not required to match
    /// priority order.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut data = serde_json::to_string_pretty(self).context("failed to serialize PRD")?;
        data.push('\n');
        std::fs::write(path, data)
            .with_context(|| format!("failed to write PRD file {}", path.display()))
    }

    /// Whether every story passes. Vacuously true for zero stories.
    pub fn all_complete(&self) -> bool {
        self.user_stories.iter().all(|s| s.passes)
    }

    /// Whether any story carries progress (`passes` or `inProgress`).
    pub fn has_progress(&self) -> bool {
        self.user_stories.iter().any(|s| s.passes || s.in_progress)
    }

    /// Overlay stored progress onto stories loaded from the file.
    ///
    /// Specification fields stay as read; `passes` and `in_progress` are
    /// replaced for every story id present in `progress`.
    pub fn overlay_progress(&mut self, progress: &HashMap<String, (bool, bool)>) {
        for story in &mut self.user_stories {
            if let Some(&(passes, in_progress)) = progress.get(&story.id) {
                story.passes = passes;
                story.in_progress = in_progress;
            }
        }
    }
}

/// How to combine a regenerated PRD with one that already has progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeChoice {
    /// Keep `passes`/`inProgress` for matching story ids; drop unmatched old
    /// ids; new ids start without progress.
    Merge,
    /// Discard all progress.
    Overwrite,
    /// Abort; keep the old PRD untouched.
    Cancel,
}

/// Copy progress from `old` into `new` for stories with matching ids.
///
/// Stories only present in `new` keep their defaults; stories only present
/// in `old` are dropped with it.
pub fn merge_progress(old: &Prd, new: &mut Prd) {
    let old_status: HashMap<&str, (bool, bool)> = old
        .user_stories
        .iter()
        .map(|s| (s.id.as_str(), (s.passes, s.in_progress)))
        .collect();

    for story in &mut new.user_stories {
        if let Some(&(passes, in_progress)) = old_status.get(story.id.as_str()) {
            story.passes = passes;
            story.in_progress = in_progress;
        }
    }
}

/// Apply a [`MergeChoice`] to a regenerated PRD.
///
/// Returns the PRD to write, or `None` for [`MergeChoice::Cancel`].
pub fn combine(existing: &Prd, mut incoming: Prd, choice: MergeChoice) -> Option<Prd> {
    match choice {
        MergeChoice::Merge => {
            merge_progress(existing, &mut incoming);
            Some(incoming)
        }
        MergeChoice::Overwrite => Some(incoming),
        MergeChoice::Cancel => None,
    }
}
