//! Filesystem layout rooted at the user's project directory.
//!
//! All Foreman state lives under a single `.foreman/` subdirectory:
//!
//! ```text
//! .foreman/
//!   foreman.db               # embedded SQLite store
//!   config.yaml              # project-level settings
//!   prds/<name>/prd.md       # human-authored spec
//!   prds/<name>/prd.json     # canonical PRD
//!   prds/<name>/agent.log    # per-PRD append-only agent log
//!   repos/<name>/            # cloned remote repo (optional)
//!   worktrees/<name>/        # per-PRD git worktree checkout
//! ```

use std::path::{Path, PathBuf};

/// Name of the Foreman state directory inside a project.
pub const SYS_DIR: &str = ".foreman";

/// Filename of the embedded SQLite store.
pub const DB_FILE: &str = "foreman.db";

/// Filename of the project config file.
pub const CONFIG_FILE: &str = "config.yaml";

/// Filename of the per-PRD append-only agent log.
pub const AGENT_LOG_FILE: &str = "agent.log";

/// Prefix for automatically created branches (`foreman/<prd-name>`).
pub const BRANCH_PREFIX: &str = "foreman";

/// Root of the Foreman state directory.
pub fn sys_dir(base_dir: &Path) -> PathBuf {
    base_dir.join(SYS_DIR)
}

/// Path to the embedded store.
pub fn db_path(base_dir: &Path) -> PathBuf {
    sys_dir(base_dir).join(DB_FILE)
}

/// Path to the project config file.
pub fn config_path(base_dir: &Path) -> PathBuf {
    sys_dir(base_dir).join(CONFIG_FILE)
}

/// Directory containing all PRDs.
pub fn prds_dir(base_dir: &Path) -> PathBuf {
    sys_dir(base_dir).join("prds")
}

/// Directory for a single named PRD.
pub fn prd_dir(base_dir: &Path, name: &str) -> PathBuf {
    prds_dir(base_dir).join(name)
}

/// Path to a PRD's canonical JSON file.
pub fn prd_json_path(base_dir: &Path, name: &str) -> PathBuf {
    prd_dir(base_dir, name).join("prd.json")
}

/// Path to a PRD's markdown source.
pub fn prd_md_path(base_dir: &Path, name: &str) -> PathBuf {
    prd_dir(base_dir, name).join("prd.md")
}

/// Path to a PRD's append-only agent log.
pub fn agent_log_path(base_dir: &Path, name: &str) -> PathBuf {
    prd_dir(base_dir, name).join(AGENT_LOG_FILE)
}

/// Directory containing cloned repositories.
pub fn repos_dir(base_dir: &Path) -> PathBuf {
    sys_dir(base_dir).join("repos")
}

/// Directory for a single cloned repository.
pub fn repo_dir(base_dir: &Path, name: &str) -> PathBuf {
    repos_dir(base_dir).join(name)
}

/// Directory containing all per-PRD worktrees.
pub fn worktrees_dir(base_dir: &Path) -> PathBuf {
    sys_dir(base_dir).join("worktrees")
}

/// Deterministic worktree checkout path for a PRD.
pub fn worktree_path_for_prd(base_dir: &Path, prd_name: &str) -> PathBuf {
    worktrees_dir(base_dir).join(prd_name)
}

/// Branch name automatically derived from a PRD name.
pub fn branch_for_prd(prd_name: &str) -> String {
    format!("{}/{}", BRANCH_PREFIX, prd_name)
}

/// Check that a PRD name is a valid slug: letters, digits, `-`, `_`.
///
/// PRD names become directory names and branch name components, so anything
/// else is rejected at registration time.
pub fn is_valid_prd_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let base = Path::new("/work/project");
        assert_eq!(
            db_path(base),
            PathBuf::from("/work/project/.foreman/foreman.db")
        );
        assert_eq!(
            prd_json_path(base, "auth"),
            PathBuf::from("/work/project/.foreman/prds/auth/prd.json")
        );
        assert_eq!(
            worktree_path_for_prd(base, "auth"),
            PathBuf::from("/work/project/.foreman/worktrees/auth")
        );
        assert_eq!(
            agent_log_path(base, "auth"),
            PathBuf::from("/work/project/.foreman/prds/auth/agent.log")
        );
    }

    #[test]
    fn test_branch_for_prd() {
        assert_eq!(branch_for_prd("auth"), "foreman/auth");
    }

    #[test]
    fn test_prd_name_validation() {
        assert!(is_valid_prd_name("auth"));
        assert!(is_valid_prd_name("user-auth_v2"));
        assert!(!is_valid_prd_name(""));
        assert!(!is_valid_prd_name("auth service"));
        assert!(!is_valid_prd_name("../escape"));
        assert!(!is_valid_prd_name("a/b"));
    }
}
