//! `convoy queue` subcommands: inspect, resume, and drive the merge queue.
//!
//! These commands operate directly on the durable queue file and the git
//! mechanics in [`convoy_core::merge`]; they do not require an `IssueStore` or
//! `AgentRuntime` implementation, so they work against any checked-out base
//! repository without a production issue-tracker integration wired in.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use convoy_core::config::ConvoyConfig;
use convoy_core::merge::MergeExecutor;
use convoy_core::merge_queue::{MergeQueue, ProcessResult};

pub fn github_token() -> Result<String> {
    std::env::var("CONVOY_GITHUB_TOKEN").context("CONVOY_GITHUB_TOKEN must be set")
}

/// Build a `MergeQueue` for the configured repository, reading the GitHub
/// token from `CONVOY_GITHUB_TOKEN` (never from `convoy.toml`, so the token
/// never lands in a config file an operator might commit).
pub fn build_queue(cfg: &ConvoyConfig) -> Result<MergeQueue> {
    let token = github_token()?;
    let executor = MergeExecutor::with_timeout(
        cfg.base_repo_dir(),
        cfg.general.repo_ref.clone(),
        token,
        Duration::from_secs(cfg.git.command_timeout_seconds),
    );
    Ok(MergeQueue::from_config(cfg, executor)?)
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub length: usize,
    pub paused: bool,
    pub pause_reason: Option<String>,
}

pub fn status(queue: &MergeQueue) -> Result<QueueStatus> {
    Ok(QueueStatus {
        length: queue.length()?,
        paused: queue.paused()?,
        pause_reason: queue.pause_reason()?,
    })
}

pub fn print_status(status: &QueueStatus) {
    println!("Merge queue: {} entr{}", status.length, if status.length == 1 { "y" } else { "ies" });
    if status.paused {
        println!("Status: PAUSED");
        if let Some(reason) = &status.pause_reason {
            println!("Reason: {reason}");
        }
        println!("Run `convoy queue resume` after resolving the underlying issue.");
    } else {
        println!("Status: running");
    }
}

pub fn print_process_results(results: &[ProcessResult]) {
    if results.is_empty() {
        println!("Nothing to merge.");
        return;
    }
    for r in results {
        match r {
            ProcessResult::Merged(outcome) => {
                println!(
                    "merged issue #{} ({}) as {}",
                    outcome.issue_number, outcome.branch_name, outcome.commit_sha
                );
            }
            ProcessResult::Failed { issue_number, error } => {
                println!("issue #{issue_number} failed to merge: {error}");
                println!("queue paused; run `convoy queue resume` once resolved.");
            }
        }
    }
}
