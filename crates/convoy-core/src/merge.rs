//! Single-merge git mechanics: the sequence of version-control operations
//! needed to integrate one completed branch into trunk.
//!
//! This module knows how to perform *one* merge attempt; [`crate::merge_queue`]
//! owns the durable FIFO and the pause-on-conflict policy built on top of it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::git_exec::{self, GitExecError, DEFAULT_GIT_COMMAND_TIMEOUT};
use crate::security::redact::SecretRedactor;
use crate::{ConvoyError, Result};

/// The result of a single successful merge attempt.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub issue_number: u64,
    pub branch_name: String,
    pub commit_sha: String,
}

/// Performs the git-level mechanics of merging one branch into trunk.
pub struct MergeExecutor {
    base_repo: PathBuf,
    repo_ref: String,
    token: String,
    timeout: Duration,
}

impl MergeExecutor {
    pub fn new(base_repo: PathBuf, repo_ref: String, token: String) -> Self {
        Self::with_timeout(base_repo, repo_ref, token, DEFAULT_GIT_COMMAND_TIMEOUT)
    }

    pub fn with_timeout(base_repo: PathBuf, repo_ref: String, token: String, timeout: Duration) -> Self {
        Self {
            base_repo,
            repo_ref,
            token,
            timeout,
        }
    }

    /// Attempt to merge `origin/<branch_name>` into `base_branch`, push, and
    /// delete the remote branch. Mirrors the single-merge algorithm: refresh
    /// remote URL, fetch, checkout + pull trunk, verify branch, merge
    /// `--no-ff`, push.
    pub async fn attempt_merge(
        &self,
        issue_number: u64,
        branch_name: &str,
        base_branch: &str,
    ) -> Result<MergeOutcome> {
        self.refresh_remote_url().await;

        self.git(&["fetch", "origin"])
            .await
            .map_err(|e| ConvoyError::MergeFailed { issue_number, stderr: e.to_string() })?;

        let _ = self.git(&["checkout", base_branch]).await;
        let _ = self.git(&["pull", "origin", base_branch]).await;

        self.git(&["rev-parse", "--verify", &format!("origin/{branch_name}")])
            .await
            .map_err(|_| ConvoyError::BranchMissing(format!("origin/{branch_name}")))?;

        let message = format!("Merge issue #{issue_number} ({branch_name})");
        info!(issue_number, branch_name, "merging into trunk");
        let merge_result = self
            .git(&["merge", &format!("origin/{branch_name}"), "--no-ff", "-m", &message])
            .await;

        if let Err(e) = merge_result {
            let conflict_files = self.conflict_files().await;
            let _ = self.git(&["merge", "--abort"]).await;
            if !conflict_files.is_empty() {
                return Err(ConvoyError::MergeConflict { issue_number, files: conflict_files });
            }
            return Err(ConvoyError::MergeFailed { issue_number, stderr: e.to_string() });
        }

        let commit_sha = self
            .git(&["rev-parse", "HEAD"])
            .await
            .map_err(|e| ConvoyError::MergeFailed { issue_number, stderr: e.to_string() })?
            .trim()
            .to_string();

        self.git(&["push", "origin", base_branch])
            .await
            .map_err(|e| ConvoyError::PushFailed { issue_number, stderr: e.to_string() })?;

        self.delete_remote_branch(branch_name).await;

        Ok(MergeOutcome { issue_number, branch_name: branch_name.to_string(), commit_sha })
    }

    async fn conflict_files(&self) -> Vec<String> {
        match self.git(&["diff", "--name-only", "--diff-filter=U"]).await {
            Ok(out) => out.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn delete_remote_branch(&self, branch: &str) {
        if let Err(e) = self.git(&["push", "origin", "--delete", branch]).await {
            debug!(branch, error = %e, "remote branch deletion failed, leaving it in place");
        }
    }

    /// Rewrite the `origin` remote URL with a fresh token before any network
    /// operation, so a rotated token doesn't strand the queue mid-run.
    async fn refresh_remote_url(&self) {
        let url = format!(
            "https://x-access-token:{}@github.com/{}.git",
            self.token, self.repo_ref
        );
        let _ = self.git(&["remote", "set-url", "origin", &url]).await;
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        debug!(cwd = %self.base_repo.display(), ?args, "running git command");
        match git_exec::run_git_program_with_timeout("git", args, &self.base_repo, self.timeout).await {
            Ok(out) => Ok(out.stdout),
            Err(GitExecError::NonZeroExit { stderr, .. }) => {
                let redactor = SecretRedactor::new();
                let redacted = redactor.redact_line(&stderr);
                warn!(?args, stderr = %redacted, "git command failed");
                Err(ConvoyError::Git(format!("git {args:?} failed: {redacted}")))
            }
            Err(e) => {
                warn!(?args, error = %e, "git command did not run to completion");
                Err(ConvoyError::Git(e.to_string()))
            }
        }
    }
}
