//! Durable, pausable FIFO of completed branches awaiting integration into trunk.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ConvoyConfig;
use crate::merge::{MergeExecutor, MergeOutcome};
use crate::{ConvoyError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeQueueEntry {
    pub issue_number: u64,
    pub branch_name: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    #[serde(default)]
    entries: Vec<MergeQueueEntry>,
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    pause_reason: Option<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Outcome of processing one head-of-queue entry.
#[derive(Debug, Clone, Serialize)]
pub enum ProcessResult {
    Merged(MergeOutcome),
    Failed { issue_number: u64, error: String },
}

/// Listeners invoked after each processed entry. Implement to drive worktree
/// cleanup (on success) or ticket-label updates (either outcome).
#[async_trait::async_trait]
pub trait MergeQueueListener: Send + Sync {
    async fn on_merge_success(&self, _outcome: &MergeOutcome) {}
    async fn on_merge_conflict(&self, _issue_number: u64, _error: &str) {}
}

/// Owns the merge queue's durable state and drives [`MergeExecutor`] through it.
pub struct MergeQueue {
    queue_file: PathBuf,
    executor: MergeExecutor,
    base_branch: String,
    listeners: Vec<Box<dyn MergeQueueListener>>,
}

impl MergeQueue {
    pub fn new(queue_file: PathBuf, executor: MergeExecutor, base_branch: String) -> Result<Self> {
        if let Some(parent) = queue_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { queue_file, executor, base_branch, listeners: Vec::new() })
    }

    pub fn from_config(cfg: &ConvoyConfig, executor: MergeExecutor) -> Result<Self> {
        let queue_file = cfg.session_state_dir().join("merge_queue.json");
        Self::new(queue_file, executor, cfg.worktree.base_branch.clone())
    }

    pub fn add_listener(&mut self, listener: Box<dyn MergeQueueListener>) {
        self.listeners.push(listener);
    }

    /// Append `issue_number` to the queue unless already present (no-op dedup).
    pub fn enqueue(&self, issue_number: u64, branch_name: Option<&str>) -> Result<()> {
        let mut state = self.load_state()?;
        if state.entries.iter().any(|e| e.issue_number == issue_number) {
            warn!(issue_number, "issue already in merge queue, ignoring");
            return Ok(());
        }
        let branch = branch_name.map(String::from).unwrap_or_else(|| format!("issue-{issue_number}"));
        state.entries.push(MergeQueueEntry {
            issue_number,
            branch_name: branch,
            completed_at: Utc::now(),
            attempts: 0,
            last_error: None,
        });
        info!(issue_number, position = state.entries.len(), "enqueued for merge");
        self.save_state(&state)
    }

    pub fn position(&self, issue_number: u64) -> Result<usize> {
        let state = self.load_state()?;
        Ok(state
            .entries
            .iter()
            .position(|e| e.issue_number == issue_number)
            .map(|i| i + 1)
            .unwrap_or(0))
    }

    pub fn length(&self) -> Result<usize> {
        Ok(self.load_state()?.entries.len())
    }

    pub fn paused(&self) -> Result<bool> {
        Ok(self.load_state()?.paused)
    }

    pub fn pause_reason(&self) -> Result<Option<String>> {
        Ok(self.load_state()?.pause_reason)
    }

    /// Clear the pause flag. Does not itself retry a merge; the caller must
    /// invoke `process_queue` afterward to make progress.
    pub fn resume(&self) -> Result<bool> {
        let mut state = self.load_state()?;
        if !state.paused {
            return Ok(false);
        }
        state.paused = false;
        state.pause_reason = None;
        self.save_state(&state)?;
        info!("merge queue resumed");
        Ok(true)
    }

    /// Attempt up to `max_merges` merges, stopping on pause or an empty queue.
    pub async fn process_queue(&self, max_merges: usize) -> Result<Vec<ProcessResult>> {
        let mut results = Vec::new();
        for _ in 0..max_merges {
            let mut state = self.load_state()?;
            if state.paused {
                info!(reason = ?state.pause_reason, "merge queue paused, not processing");
                break;
            }
            let Some(entry) = state.entries.first().cloned() else {
                break;
            };

            info!(issue_number = entry.issue_number, branch = entry.branch_name, "processing merge");
            match self
                .executor
                .attempt_merge(entry.issue_number, &entry.branch_name, &self.base_branch)
                .await
            {
                Ok(outcome) => {
                    state.entries.remove(0);
                    self.save_state(&state)?;
                    for l in &self.listeners {
                        l.on_merge_success(&outcome).await;
                    }
                    results.push(ProcessResult::Merged(outcome));
                }
                Err(e) => {
                    let error = error_message(&e);
                    state.entries[0].attempts += 1;
                    state.entries[0].last_error = Some(error.clone());
                    state.paused = true;
                    state.pause_reason = Some(format!(
                        "merge failed on issue #{}: {error}",
                        entry.issue_number
                    ));
                    self.save_state(&state)?;
                    for l in &self.listeners {
                        l.on_merge_conflict(entry.issue_number, &error).await;
                    }
                    results.push(ProcessResult::Failed { issue_number: entry.issue_number, error });
                    break;
                }
            }
        }
        Ok(results)
    }

    // -------------------------------------------------------------------
    // Persistence (atomic write-temp-then-rename; self-healing on read)
    // -------------------------------------------------------------------

    fn load_state(&self) -> Result<QueueState> {
        if !self.queue_file.exists() {
            return Ok(QueueState::default());
        }
        let contents = match std::fs::read_to_string(&self.queue_file) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to read merge queue file, treating as empty");
                return Ok(QueueState::default());
            }
        };
        match serde_json::from_str(&contents) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(error = %e, "corrupt merge queue file, treating as empty and unpaused");
                Ok(QueueState::default())
            }
        }
    }

    fn save_state(&self, state: &QueueState) -> Result<()> {
        let mut state = state.clone();
        state.updated_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| ConvoyError::Config(format!("failed to serialize merge queue: {e}")))?;
        let tmp_path = self.queue_file.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.queue_file)?;
        Ok(())
    }
}

fn error_message(e: &ConvoyError) -> String {
    match e {
        ConvoyError::MergeConflict { files, .. } => format!("conflict in: {}", files.join(", ")),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn queue_at(dir: &std::path::Path) -> MergeQueue {
        let executor = MergeExecutor::new(dir.join("base-repo"), "acme/widgets".into(), "tok".into());
        MergeQueue::new(dir.join("merge_queue.json"), executor, "main".into()).unwrap()
    }

    #[test]
    fn enqueue_dedups_by_issue_number() {
        let tmp = tempfile::tempdir().unwrap();
        let q = queue_at(tmp.path());
        q.enqueue(1, None).unwrap();
        q.enqueue(1, None).unwrap();
        assert_eq!(q.length().unwrap(), 1);
    }

    #[test]
    fn position_and_length() {
        let tmp = tempfile::tempdir().unwrap();
        let q = queue_at(tmp.path());
        q.enqueue(10, None).unwrap();
        q.enqueue(11, None).unwrap();
        assert_eq!(q.position(10).unwrap(), 1);
        assert_eq!(q.position(11).unwrap(), 2);
        assert_eq!(q.position(99).unwrap(), 0);
        assert_eq!(q.length().unwrap(), 2);
    }

    #[test]
    fn resume_clears_pause_only_when_paused() {
        let tmp = tempfile::tempdir().unwrap();
        let q = queue_at(tmp.path());
        assert!(!q.resume().unwrap());

        let mut state = q.load_state().unwrap();
        state.paused = true;
        state.pause_reason = Some("boom".into());
        q.save_state(&state).unwrap();

        assert!(q.resume().unwrap());
        assert!(!q.paused().unwrap());
        assert!(q.pause_reason().unwrap().is_none());
    }

    #[tokio::test]
    async fn process_queue_empty_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let q = queue_at(tmp.path());
        let results = q.process_queue(5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn process_queue_paused_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let q = queue_at(tmp.path());
        q.enqueue(1, None).unwrap();
        let mut state = q.load_state().unwrap();
        state.paused = true;
        state.pause_reason = Some("prior conflict".into());
        q.save_state(&state).unwrap();

        let results = q.process_queue(5).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(q.length().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_merge_pauses_and_leaves_entry_at_head() {
        // No real git repo at base-repo, so the executor's first `git fetch`
        // fails -- exercising the failure/pause path without network access.
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("base-repo")).unwrap();
        let q = queue_at(tmp.path());
        q.enqueue(5, None).unwrap();

        let results = q.process_queue(3).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], ProcessResult::Failed { issue_number: 5, .. }));
        assert!(q.paused().unwrap());
        assert_eq!(q.length().unwrap(), 1);
        assert_eq!(q.position(5).unwrap(), 1);
    }

    struct CountingListener {
        successes: Arc<AtomicUsize>,
        conflicts: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl MergeQueueListener for CountingListener {
        async fn on_merge_success(&self, _outcome: &MergeOutcome) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_merge_conflict(&self, _issue_number: u64, _error: &str) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn listener_fires_on_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("base-repo")).unwrap();
        let mut q = queue_at(tmp.path());
        let conflicts = Arc::new(AtomicUsize::new(0));
        let successes = Arc::new(AtomicUsize::new(0));
        q.add_listener(Box::new(CountingListener { successes: successes.clone(), conflicts: conflicts.clone() }));
        q.enqueue(1, None).unwrap();

        q.process_queue(1).await.unwrap();
        assert_eq!(conflicts.load(Ordering::SeqCst), 1);
        assert_eq!(successes.load(Ordering::SeqCst), 0);
    }
}
