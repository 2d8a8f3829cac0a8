//! Git plumbing used by the loop engine and worktree manager.
//!
//! Everything shells out to the `git` binary via `tokio::process`; there is
//! no in-process git implementation to keep behavior identical to what the
//! agent itself does with `bash`.

pub mod worktree;

use std::path::Path;
use std::process::Output;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::prd::Prd;

pub(crate) async fn run_git(dir: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("failed to execute git {}", args.first().unwrap_or(&"")))
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Whether the directory is inside a git repository.
pub async fn is_git_repo(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    run_git(dir, &["rev-parse", "--git-dir"])
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// The current branch name for a directory.
pub async fn current_branch(dir: &Path) -> Result<String> {
    let output = run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    if !output.status.success() {
        anyhow::bail!("failed to get current branch: {}", stderr_of(&output));
    }
    Ok(stdout_of(&output))
}

/// Whether a branch with the given name exists.
pub async fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    let output = run_git(dir, &["rev-parse", "--verify", "--quiet", branch]).await?;
    Ok(output.status.success())
}

/// The repository's default branch: `main` when present, else `master`.
pub async fn default_branch(dir: &Path) -> Result<String> {
    for candidate in ["main", "master"] {
        if branch_exists(dir, candidate).await? {
            return Ok(candidate.to_string());
        }
    }
    anyhow::bail!("no default branch (main or master) found in {}", dir.display())
}

/// Whether the branch name is a protected default branch.
pub fn is_protected_branch(branch: &str) -> bool {
    branch == "main" || branch == "master"
}

/// The HEAD commit sha of a checkout.
pub async fn head_sha(dir: &Path) -> Result<String> {
    let output = run_git(dir, &["rev-parse", "HEAD"]).await?;
    if !output.status.success() {
        anyhow::bail!("failed to get HEAD: {}", stderr_of(&output));
    }
    Ok(stdout_of(&output))
}

/// Stage all changes and commit with the given message.
///
/// Returns `false` without committing when nothing is staged.
pub async fn commit_all(dir: &Path, message: &str) -> Result<bool> {
    let output = run_git(dir, &["add", "-A"]).await?;
    if !output.status.success() {
        anyhow::bail!("failed to stage changes: {}", stderr_of(&output));
    }

    // Empty index means nothing changed since the last commit.
    let staged = run_git(dir, &["diff", "--cached", "--quiet"]).await?;
    if staged.status.success() {
        return Ok(false);
    }

    let output = run_git(dir, &["commit", "-m", message]).await?;
    if !output.status.success() {
        anyhow::bail!("failed to commit: {}", stderr_of(&output));
    }
    Ok(true)
}

/// Push the branch to origin, setting upstream.
pub async fn push_branch(dir: &Path, branch: &str) -> Result<()> {
    let output = run_git(dir, &["push", "-u", "origin", branch]).await?;
    if !output.status.success() {
        anyhow::bail!("failed to push branch: {}", stderr_of(&output));
    }
    Ok(())
}

/// Stage all changes, commit, and push to the branch.
pub async fn commit_and_push(dir: &Path, branch: &str, message: &str) -> Result<()> {
    commit_all(dir, message).await?;
    push_branch(dir, branch).await
}

/// Merge `branch` into the current HEAD of `dir`.
///
/// On success returns an empty list. On a conflicted merge, returns the
/// conflicting file paths and aborts the merge, leaving the tree as it was.
pub async fn merge_branch(dir: &Path, branch: &str) -> Result<Vec<String>> {
    let output = run_git(dir, &["merge", "--no-edit", branch]).await?;
    if output.status.success() {
        return Ok(Vec::new());
    }

    let conflicts_out = run_git(dir, &["diff", "--name-only", "--diff-filter=U"]).await?;
    let conflicts: Vec<String> = stdout_of(&conflicts_out)
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect();

    let _ = run_git(dir, &["merge", "--abort"]).await;

    if conflicts.is_empty() {
        anyhow::bail!("merge of {} failed: {}", branch, stderr_of(&output));
    }
    Ok(conflicts)
}

/// Delete a local branch.
pub async fn delete_branch(dir: &Path, branch: &str) -> Result<()> {
    let output = run_git(dir, &["branch", "-D", branch]).await?;
    if !output.status.success() {
        anyhow::bail!("failed to delete branch: {}", stderr_of(&output));
    }
    Ok(())
}

/// Clone a repository to the target directory.
pub async fn clone_repo(url: &str, target_dir: &Path) -> Result<()> {
    if let Some(parent) = target_dir.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tracing::info!(url, target = %target_dir.display(), "cloning repository");

    let output = Command::new("git")
        .args(["clone", url])
        .arg(target_dir)
        .output()
        .await
        .context("failed to execute git clone")?;
    if !output.status.success() {
        anyhow::bail!("git clone failed: {}", stderr_of(&output));
    }
    Ok(())
}

/// Initialize a new git repository in the directory.
pub async fn init_repo(dir: &Path) -> Result<()> {
    let output = run_git(dir, &["init"]).await?;
    if !output.status.success() {
        anyhow::bail!("git init failed: {}", stderr_of(&output));
    }
    Ok(())
}

/// The URL of the given remote.
pub async fn remote_url(dir: &Path, remote: &str) -> Result<String> {
    let output = run_git(dir, &["remote", "get-url", remote]).await?;
    if !output.status.success() {
        anyhow::bail!("no remote {} configured", remote);
    }
    Ok(stdout_of(&output))
}

/// Make sure `.gitignore` at the repo root lists the given entry.
///
/// The Foreman state directory must never be tracked by the repo it manages.
pub async fn ensure_ignored(repo_dir: &Path, entry: &str) -> Result<()> {
    let gitignore = repo_dir.join(".gitignore");
    let current = match tokio::fs::read_to_string(&gitignore).await {
        Ok(current) => current,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", gitignore.display()));
        }
    };

    if current.lines().any(|line| line.trim() == entry) {
        return Ok(());
    }

    let mut updated = current;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(entry);
    updated.push('\n');
    tokio::fs::write(&gitignore, updated)
        .await
        .with_context(|| format!("failed to write {}", gitignore.display()))
}

/// Conventional-commits PR title for a PRD: `feat(<prd-name>): <project>`.
pub fn pr_title(prd_name: &str, prd: &Prd) -> String {
    format!("feat({}): {}", prd_name, prd.project)
}

/// PR body with the project summary and the list of passing stories.
pub fn pr_body(prd: &Prd) -> String {
    let mut body = String::new();
    body.push_str("## Summary\n\n");
    body.push_str(&prd.description);
    body.push_str("\n\n## Changes\n\n");
    for story in &prd.user_stories {
        if story.passes {
            body.push_str(&format!("- {}: {}\n", story.id, story.title));
        }
    }
    body
}
