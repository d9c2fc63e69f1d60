//! Isolated per-ticket git worktrees, sharing the base repository's object database.
//!
//! Layout:
//! ```text
//! <workspace>/
//!   base-repo/                 sole holder of the object database
//!   worktrees/issue-<N>/       checked out on branch issue-<N>
//!   session-state/
//!     worktrees.json           tracked Worktree records
//!     issue-<N>-session.txt    session id for issue N
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ConvoyConfig;
use crate::git_exec::{self, GitExecError, DEFAULT_GIT_COMMAND_TIMEOUT};
use crate::{ConvoyError, Result};

/// A tracked, isolated checkout for one ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worktree {
    pub issue_number: u64,
    pub session_id: String,
    pub path: PathBuf,
    pub branch_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorktreeState {
    #[serde(default)]
    worktrees: Vec<Worktree>,
}

/// Creates, tracks, and destroys isolated per-ticket checkouts rooted at the
/// base repository.
pub struct WorktreeManager {
    base_repo: PathBuf,
    worktrees_dir: PathBuf,
    session_state_dir: PathBuf,
    state_file: PathBuf,
    timeout: Duration,
}

impl WorktreeManager {
    pub fn new(
        base_repo: PathBuf,
        worktrees_dir: PathBuf,
        session_state_dir: PathBuf,
    ) -> Result<Self> {
        Self::with_timeout(base_repo, worktrees_dir, session_state_dir, DEFAULT_GIT_COMMAND_TIMEOUT)
    }

    pub fn with_timeout(
        base_repo: PathBuf,
        worktrees_dir: PathBuf,
        session_state_dir: PathBuf,
        timeout: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(&worktrees_dir)?;
        std::fs::create_dir_all(&session_state_dir)?;
        let state_file = session_state_dir.join("worktrees.json");
        Ok(Self {
            base_repo,
            worktrees_dir,
            session_state_dir,
            state_file,
            timeout,
        })
    }

    pub fn from_config(cfg: &ConvoyConfig) -> Result<Self> {
        Self::with_timeout(
            cfg.base_repo_dir(),
            cfg.worktrees_dir(),
            cfg.session_state_dir(),
            Duration::from_secs(cfg.git.command_timeout_seconds),
        )
    }

    /// The deterministic path for a ticket's worktree, whether or not it exists yet.
    pub fn path(&self, issue_number: u64) -> PathBuf {
        self.worktrees_dir.join(format!("issue-{issue_number}"))
    }

    fn branch_name(issue_number: u64) -> String {
        format!("issue-{issue_number}")
    }

    fn session_mapping_path(&self, issue_number: u64) -> PathBuf {
        self.session_state_dir
            .join(format!("issue-{issue_number}-session.txt"))
    }

    /// Reject a path that would not resolve inside `worktrees_dir`.
    ///
    /// `Path::starts_with` compares components lexically and does not resolve
    /// `..`, so a path like `<worktrees_dir>/../escape` would otherwise pass
    /// despite escaping the root. Reject any `ParentDir` component up front.
    fn validate_path(&self, path: &Path) -> Result<()> {
        use std::path::Component;

        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ConvoyError::WorktreeCreateFailed(format!(
                "worktree path {path:?} escapes worktrees root {:?}",
                self.worktrees_dir
            )));
        }

        if path.starts_with(&self.worktrees_dir) {
            Ok(())
        } else {
            Err(ConvoyError::WorktreeCreateFailed(format!(
                "worktree path {path:?} escapes worktrees root {:?}",
                self.worktrees_dir
            )))
        }
    }

    pub fn exists(&self, issue_number: u64) -> bool {
        self.path(issue_number).exists()
    }

    // -------------------------------------------------------------------
    // Create / Cleanup
    // -------------------------------------------------------------------

    /// Create an isolated worktree for `issue_number`, checking out an existing
    /// `issue-<N>` branch if one is found locally or on origin, else branching
    /// off `origin/<base_branch>` (or the local `base_branch` with no remote).
    pub async fn create(
        &self,
        issue_number: u64,
        session_id: &str,
        base_branch: &str,
    ) -> Result<Worktree> {
        let path = self.path(issue_number);
        self.validate_path(&path)?;
        let branch = Self::branch_name(issue_number);

        info!(issue_number, session_id, "creating worktree");

        if path.exists() {
            warn!(issue_number, "worktree already exists, recreating");
            self.cleanup(issue_number, true).await?;
        }

        self.fetch_origin().await;

        let path_str = path
            .to_str()
            .ok_or_else(|| ConvoyError::WorktreeCreateFailed("worktree path is not valid UTF-8".into()))?;

        if self.branch_exists(&branch).await {
            debug!(branch, "checking out existing branch into new worktree");
            self.git(&["worktree", "add", path_str, &branch]).await?;
        } else {
            let start_point = if self.has_remote("origin").await {
                format!("origin/{base_branch}")
            } else {
                base_branch.to_string()
            };
            debug!(branch, start_point, "creating new branch for worktree");
            self.git(&["worktree", "add", "-b", &branch, path_str, &start_point])
                .await?;
        }

        self.configure_identity(&path).await;

        self.write_session_mapping(issue_number, session_id)?;

        let record = Worktree {
            issue_number,
            session_id: session_id.to_string(),
            path: path.clone(),
            branch_name: branch,
            created_at: Utc::now(),
        };
        self.save_record(record.clone())?;

        info!(issue_number, path = %path.display(), "worktree created");
        Ok(record)
    }

    /// Remove the working directory and all tracked state for `issue_number`.
    /// Best-effort: falls back to recursive directory removal if the
    /// version-control command fails.
    pub async fn cleanup(&self, issue_number: u64, prune: bool) -> Result<bool> {
        let path = self.path(issue_number);
        info!(issue_number, "cleaning up worktree");

        let mut ok = true;
        if path.exists() {
            let path_str = path.to_str().unwrap_or_default();
            if let Err(e) = self.git(&["worktree", "remove", path_str, "--force"]).await {
                warn!(issue_number, error = %e, "git worktree remove failed, falling back to rmdir");
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    warn!(issue_number, error = %e, "fallback directory removal also failed");
                    ok = false;
                }
            }
        }

        if prune {
            let _ = self.git(&["worktree", "prune"]).await;
        }

        self.remove_session_mapping(issue_number)?;
        self.remove_record(issue_number)?;

        Ok(ok)
    }

    /// Remove every worktree older than `max_age_hours`, oldest first.
    pub async fn cleanup_stale(&self, max_age_hours: i64) -> Result<u64> {
        let mut worktrees = self.list()?;
        worktrees.sort_by_key(|w| w.created_at);

        let now = Utc::now();
        let mut cleaned = 0u64;
        for w in worktrees {
            let age_hours = (now - w.created_at).num_seconds() as f64 / 3600.0;
            if age_hours > max_age_hours as f64 {
                info!(issue_number = w.issue_number, age_hours, "stale worktree, cleaning up");
                if self.cleanup(w.issue_number, true).await? {
                    cleaned += 1;
                }
            }
        }
        Ok(cleaned)
    }

    // -------------------------------------------------------------------
    // Pure lookups
    // -------------------------------------------------------------------

    pub fn info(&self, issue_number: u64) -> Result<Option<Worktree>> {
        Ok(self.load_state()?.worktrees.into_iter().find(|w| w.issue_number == issue_number))
    }

    pub fn list(&self) -> Result<Vec<Worktree>> {
        Ok(self.load_state()?.worktrees)
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    pub fn session_for(&self, issue_number: u64) -> Option<String> {
        std::fs::read_to_string(self.session_mapping_path(issue_number))
            .ok()
            .map(|s| s.trim().to_string())
    }

    // -------------------------------------------------------------------
    // Git helpers
    // -------------------------------------------------------------------

    async fn git(&self, args: &[&str]) -> Result<String> {
        debug!(cwd = %self.base_repo.display(), ?args, "running git command");
        match git_exec::run_git_program_with_timeout("git", args, &self.base_repo, self.timeout).await {
            Ok(out) => Ok(out.stdout),
            Err(GitExecError::NonZeroExit { stderr, .. }) => {
                Err(ConvoyError::Git(format!("git {args:?} failed: {stderr}")))
            }
            Err(e) => Err(ConvoyError::Git(e.to_string())),
        }
    }

    async fn fetch_origin(&self) {
        if self.has_remote("origin").await {
            let _ = self.git(&["fetch", "origin"]).await;
        }
    }

    async fn has_remote(&self, name: &str) -> bool {
        self.git(&["remote", "get-url", name]).await.is_ok()
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        if let Ok(out) = self.git(&["ls-remote", "--heads", "origin", branch]).await {
            if out.contains(branch) {
                return true;
            }
        }
        matches!(self.git(&["branch", "--list", branch]).await, Ok(out) if out.contains(branch))
    }

    async fn configure_identity(&self, worktree_path: &Path) {
        let _ = Command::new("git")
            .args(["config", "user.name", "convoy-bot"])
            .current_dir(worktree_path)
            .output()
            .await;
        let _ = Command::new("git")
            .args(["config", "user.email", "convoy-bot@users.noreply.github.com"])
            .current_dir(worktree_path)
            .output()
            .await;
    }

    // -------------------------------------------------------------------
    // Session mapping files
    // -------------------------------------------------------------------

    fn write_session_mapping(&self, issue_number: u64, session_id: &str) -> Result<()> {
        std::fs::write(self.session_mapping_path(issue_number), session_id)?;
        Ok(())
    }

    fn remove_session_mapping(&self, issue_number: u64) -> Result<()> {
        let path = self.session_mapping_path(issue_number);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // State persistence (atomic write-temp-then-rename; self-healing on read)
    // -------------------------------------------------------------------

    fn load_state(&self) -> Result<WorktreeState> {
        if !self.state_file.exists() {
            return Ok(WorktreeState::default());
        }
        let contents = match std::fs::read_to_string(&self.state_file) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to read worktree state file, treating as empty");
                return Ok(WorktreeState::default());
            }
        };
        match serde_json::from_str(&contents) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(error = %e, "corrupt worktree state file, treating as empty");
                Ok(WorktreeState::default())
            }
        }
    }

    fn save_state(&self, state: &WorktreeState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| ConvoyError::WorktreeCreateFailed(format!("failed to serialize state: {e}")))?;
        let tmp_path = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.state_file)?;
        Ok(())
    }

    fn save_record(&self, record: Worktree) -> Result<()> {
        let mut state = self.load_state()?;
        state.worktrees.retain(|w| w.issue_number != record.issue_number);
        state.worktrees.push(record);
        self.save_state(&state)
    }

    fn remove_record(&self, issue_number: u64) -> Result<()> {
        let mut state = self.load_state()?;
        state.worktrees.retain(|w| w.issue_number != issue_number);
        self.save_state(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_base_repo() -> (tempfile::TempDir, WorktreeManager) {
        let tmp = tempfile::tempdir().unwrap();
        let base_repo = tmp.path().join("base-repo");
        tokio::fs::create_dir_all(&base_repo).await.unwrap();

        let init = |args: &'static [&'static str]| {
            let base_repo = base_repo.clone();
            async move {
                Command::new("git")
                    .args(args)
                    .current_dir(&base_repo)
                    .output()
                    .await
                    .unwrap()
            }
        };
        init(&["init", "-b", "main"]).await;
        init(&["config", "user.email", "test@example.com"]).await;
        init(&["config", "user.name", "Test"]).await;
        tokio::fs::write(base_repo.join("README.md"), "hi\n").await.unwrap();
        init(&["add", "."]).await;
        init(&["commit", "-m", "initial"]).await;

        let worktrees_dir = tmp.path().join("worktrees");
        let session_state_dir = tmp.path().join("session-state");
        let mgr = WorktreeManager::new(base_repo, worktrees_dir, session_state_dir).unwrap();
        (tmp, mgr)
    }

    #[tokio::test]
    async fn create_uses_issue_number_naming() {
        let (_tmp, mgr) = setup_base_repo().await;
        let wt = mgr.create(42, "sess-1", "main").await.unwrap();
        assert_eq!(wt.branch_name, "issue-42");
        assert!(wt.path.ends_with("issue-42"));
        assert!(wt.path.exists());
        assert_eq!(mgr.session_for(42).as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn recreate_on_existing_path() {
        let (_tmp, mgr) = setup_base_repo().await;
        mgr.create(7, "sess-a", "main").await.unwrap();
        let wt2 = mgr.create(7, "sess-b", "main").await.unwrap();
        assert_eq!(wt2.session_id, "sess-b");
        assert_eq!(mgr.session_for(7).as_deref(), Some("sess-b"));
        assert_eq!(mgr.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_path_and_mapping() {
        let (_tmp, mgr) = setup_base_repo().await;
        let wt = mgr.create(5, "sess-1", "main").await.unwrap();
        assert!(mgr.cleanup(5, true).await.unwrap());
        assert!(!wt.path.exists());
        assert!(mgr.info(5).unwrap().is_none());
        assert!(mgr.session_for(5).is_none());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let (_tmp, mgr) = setup_base_repo().await;
        mgr.create(9, "sess-1", "main").await.unwrap();
        mgr.cleanup(9, true).await.unwrap();
        // second cleanup with no directory present must not error
        assert!(mgr.cleanup(9, true).await.unwrap());
    }

    #[tokio::test]
    async fn path_validation_rejects_traversal() {
        let (_tmp, mgr) = setup_base_repo().await;
        let bad = mgr.worktrees_dir.join("..").join("escape");
        assert!(mgr.validate_path(&bad).is_err());
    }

    #[tokio::test]
    async fn corrupt_state_file_self_heals() {
        let (_tmp, mgr) = setup_base_repo().await;
        mgr.create(1, "sess-1", "main").await.unwrap();
        std::fs::write(&mgr.state_file, "{ not json").unwrap();
        assert_eq!(mgr.list().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn isolation_two_worktrees_distinct() {
        let (_tmp, mgr) = setup_base_repo().await;
        let wt1 = mgr.create(1, "s1", "main").await.unwrap();
        let wt2 = mgr.create(2, "s2", "main").await.unwrap();
        assert_ne!(wt1.path, wt2.path);
        assert_ne!(wt1.branch_name, wt2.branch_name);
    }
}
