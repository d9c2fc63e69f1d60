use thiserror::Error;

/// Top-level error type for the convoy-core library.
#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// C1 could not make the base repository usable.
    #[error("provision failed: {0}")]
    ProvisionFailed(String),

    /// C2 could not materialise a worktree.
    #[error("worktree create failed: {0}")]
    WorktreeCreateFailed(String),

    /// C4 expected a branch to exist on the remote and it did not.
    #[error("branch missing: {0}")]
    BranchMissing(String),

    /// Merge halted with unmerged paths.
    #[error("merge conflict on issue #{issue_number} in: {files:?}")]
    MergeConflict { issue_number: u64, files: Vec<String> },

    /// Merge command failed without listable conflicts.
    #[error("merge failed for issue #{issue_number}: {stderr}")]
    MergeFailed { issue_number: u64, stderr: String },

    /// Local merge succeeded but the remote update did not.
    #[error("push failed for issue #{issue_number}: {stderr}")]
    PushFailed { issue_number: u64, stderr: String },

    /// The issue tracker is unreachable; callers should treat this as transient.
    #[error("issue tracker unavailable: {0}")]
    TrackerUnavailable(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic git subprocess error, for cases not covered by a more specific variant.
    #[error("git error: {0}")]
    Git(String),
}

impl From<crate::git_exec::GitExecError> for ConvoyError {
    fn from(e: crate::git_exec::GitExecError) -> Self {
        ConvoyError::Git(e.to_string())
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, ConvoyError>;
