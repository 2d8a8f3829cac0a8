//! Git worktree lifecycle: one isolated checkout per PRD, each on its own
//! branch derived from the repository's default branch.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{branch_exists, current_branch, default_branch, run_git, stderr_of, stdout_of};
use crate::config::Config;
use crate::paths;

/// A worktree as reported by `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

/// Whether the path is a linked worktree checkout.
///
/// Linked worktrees have a `.git` *file* pointing back at the main
/// repository, where a primary checkout has a `.git` directory.
pub fn is_worktree(path: &Path) -> bool {
    path.join(".git").is_file()
}

/// Create (or reuse) a worktree at `worktree_path` checked out on `branch`.
///
/// When the branch does not exist yet it is created from the repository's
/// default branch, never from the current HEAD. An existing checkout on the
/// expected branch is reused; one on a different branch or corrupt is
/// removed and recreated.
pub async fn create_worktree(repo_dir: &Path, worktree_path: &Path, branch: &str) -> Result<()> {
    if !branch_exists(repo_dir, branch).await? {
        let base = default_branch(repo_dir).await?;
        tracing::info!(branch, base, "creating branch for worktree");
        let output = run_git(repo_dir, &["branch", branch, &base]).await?;
        if !output.status.success() {
            anyhow::bail!("failed to create branch {}: {}", branch, stderr_of(&output));
        }
    }

    if worktree_path.exists() {
        if is_worktree(worktree_path) {
            match current_branch(worktree_path).await {
                Ok(existing) if existing == branch => {
                    tracing::debug!(path = %worktree_path.display(), branch, "reusing worktree");
                    return Ok(());
                }
                _ => {}
            }
        }
        // Wrong branch or corrupt checkout: start over.
        tracing::info!(path = %worktree_path.display(), "recreating stale worktree");
        remove_worktree(repo_dir, worktree_path).await?;
    }

    if let Some(parent) = worktree_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let path_str = worktree_path.to_string_lossy();
    let output = run_git(repo_dir, &["worktree", "add", &path_str, branch]).await?;
    if !output.status.success() {
        anyhow::bail!(
            "failed to create worktree at {}: {}",
            worktree_path.display(),
            stderr_of(&output)
        );
    }
    Ok(())
}

/// Remove a worktree checkout. Idempotent: a missing worktree is not an
/// error.
pub async fn remove_worktree(repo_dir: &Path, worktree_path: &Path) -> Result<()> {
    if !worktree_path.exists() {
        let _ = prune(repo_dir).await;
        return Ok(());
    }

    let path_str = worktree_path.to_string_lossy();
    let output = run_git(repo_dir, &["worktree", "remove", "--force", &path_str]).await?;
    if !output.status.success() {
        // Corrupt checkouts confuse git; fall back to deleting the directory
        // and pruning the registration.
        tracing::warn!(
            path = %worktree_path.display(),
            error = %stderr_of(&output),
            "git worktree remove failed, deleting directory"
        );
        tokio::fs::remove_dir_all(worktree_path)
            .await
            .with_context(|| format!("failed to remove {}", worktree_path.display()))?;
        let _ = prune(repo_dir).await;
    }
    Ok(())
}

/// List the repository's worktrees, including the primary checkout.
pub async fn list_worktrees(repo_dir: &Path) -> Result<Vec<WorktreeInfo>> {
    let output = run_git(repo_dir, &["worktree", "list", "--porcelain"]).await?;
    if !output.status.success() {
        anyhow::bail!("failed to list worktrees: {}", stderr_of(&output));
    }

    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;
    for line in stdout_of(&output).lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                worktrees.push(info);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                branch: None,
                head: None,
            });
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            if let Some(info) = current.as_mut() {
                info.head = Some(head.to_string());
            }
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some(info) = current.as_mut() {
                info.branch = Some(
                    branch
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch)
                        .to_string(),
                );
            }
        }
    }
    if let Some(info) = current.take() {
        worktrees.push(info);
    }
    Ok(worktrees)
}

/// Prune stale worktree registrations.
pub async fn prune(repo_dir: &Path) -> Result<()> {
    let output = run_git(repo_dir, &["worktree", "prune"]).await?;
    if !output.status.success() {
        anyhow::bail!("failed to prune worktrees: {}", stderr_of(&output));
    }
    Ok(())
}

/// Run a setup command inside a freshly created worktree.
///
/// Returns the combined output; a non-zero exit is an error.
pub async fn run_setup_command(worktree_path: &Path, command: &str) -> Result<String> {
    tracing::info!(path = %worktree_path.display(), command, "running worktree setup command");

    let output = tokio::process::Command::new("bash")
        .arg("-c")
        .arg(command)
        .current_dir(worktree_path)
        .output()
        .await
        .context("failed to execute setup command")?;

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        anyhow::bail!("setup command failed: {}", combined.trim());
    }
    Ok(combined)
}

/// Ensure a worktree exists for a PRD, returning its path and branch.
///
/// The branch defaults to `foreman/<prd-name>`; pass `branch_override` when
/// the user picked a different name. Returns `None` (base-directory
/// fallback) when the repo is not a valid git repository or worktree
/// creation fails — the loop then runs in `repo_dir` directly.
pub async fn ensure_for_prd(
    repo_dir: &Path,
    base_dir: &Path,
    prd_name: &str,
    branch_override: Option<&str>,
    config: &Config,
) -> Option<(PathBuf, String)> {
    if !super::is_git_repo(repo_dir).await {
        tracing::debug!(repo = %repo_dir.display(), "not a git repository, skipping worktree");
        return None;
    }

    let branch = branch_override
        .map(|b| b.to_string())
        .unwrap_or_else(|| paths::branch_for_prd(prd_name));
    let worktree_path = paths::worktree_path_for_prd(base_dir, prd_name);
    let already_present = is_worktree(&worktree_path);

    if let Err(err) = super::ensure_ignored(repo_dir, &format!("{}/", paths::SYS_DIR)).await {
        tracing::warn!(error = %err, "failed to update .gitignore");
    }

    if let Err(err) = create_worktree(repo_dir, &worktree_path, &branch).await {
        tracing::warn!(error = %err, "worktree creation failed, falling back to base dir");
        return None;
    }

    if !already_present {
        if let Some(setup) = config.worktree.setup.as_deref() {
            if let Err(err) = run_setup_command(&worktree_path, setup).await {
                tracing::warn!(error = %err, "worktree setup command failed");
            }
        }
    }

    Some((worktree_path, branch))
}
