//! Session admission: turns buildable tickets into running agent sessions,
//! bounded by the configured slot count, and routes completed sessions on to
//! the merge queue or back to the tracker as failed.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent_runtime::{AgentOutcome, AgentRuntime, PortPair};
use crate::config::ConvoyConfig;
use crate::issue_store::{approvers_from_reactions, votes_from_reactions, IssueStore};
use crate::merge::MergeOutcome;
use crate::merge_queue::{MergeQueue, MergeQueueListener};
use crate::ticket::{self, select_buildable, Ticket};
use crate::worktree::WorktreeManager;
use crate::Result;

/// Reacts to merge outcomes on behalf of C3: on success the worktree is no
/// longer needed as corroborating evidence, so it is cleaned up and the
/// ticket closed; on conflict the ticket is labelled for operator attention.
struct SessionCompletionListener<S: IssueStore + 'static> {
    issue_store: Arc<S>,
    worktrees: Arc<WorktreeManager>,
}

#[async_trait::async_trait]
impl<S: IssueStore + 'static> MergeQueueListener for SessionCompletionListener<S> {
    async fn on_merge_success(&self, outcome: &MergeOutcome) {
        let n = outcome.issue_number;
        if let Err(e) = self.worktrees.cleanup(n, true).await {
            warn!(issue_number = n, error = %e, "worktree cleanup after merge failed");
        }
        if let Err(e) = self
            .issue_store
            .remove_labels(n, &[ticket::LABEL_MERGE_PENDING])
            .await
        {
            warn!(issue_number = n, error = %e, "failed to clear merge-pending label");
        }
        if let Err(e) = self
            .issue_store
            .add_labels(n, &[ticket::LABEL_COMPLETE, ticket::LABEL_DEPLOYED])
            .await
        {
            warn!(issue_number = n, error = %e, "failed to label ticket complete");
        }
        if let Err(e) = self
            .issue_store
            .create_comment(n, &format!("Merged as {} and deployed.", outcome.commit_sha))
            .await
        {
            warn!(issue_number = n, error = %e, "failed to comment on merged ticket");
        }
        if let Err(e) = self.issue_store.close(n).await {
            warn!(issue_number = n, error = %e, "failed to close merged ticket");
        }
    }

    async fn on_merge_conflict(&self, issue_number: u64, error: &str) {
        if let Err(e) = self
            .issue_store
            .remove_labels(issue_number, &[ticket::LABEL_MERGE_PENDING])
            .await
        {
            warn!(issue_number, error = %e, "failed to clear merge-pending label");
        }
        if let Err(e) = self
            .issue_store
            .add_labels(issue_number, &[ticket::LABEL_MERGE_CONFLICT])
            .await
        {
            warn!(issue_number, error = %e, "failed to label ticket merge-conflict");
        }
        if let Err(e) = self
            .issue_store
            .create_comment(issue_number, &format!("Merge conflict: {error}"))
            .await
        {
            warn!(issue_number, error = %e, "failed to comment on conflicted ticket");
        }
    }
}

/// Admits buildable tickets into worktrees and agent sessions, up to the
/// configured slot count, and hands completed sessions to the merge queue.
pub struct Dispatcher<S: IssueStore, R: AgentRuntime> {
    issue_store: Arc<S>,
    agent_runtime: Arc<R>,
    worktrees: Arc<WorktreeManager>,
    merge_queue: Arc<MergeQueue>,
    config: ConvoyConfig,
    /// Issue number -> reserved slot index, for sessions currently building.
    /// Authoritative source of slot occupancy; never derived from a raw count,
    /// so a freed mid-range slot can't be handed out twice.
    slots: Mutex<HashMap<u64, u32>>,
}

impl<S: IssueStore + 'static, R: AgentRuntime + 'static> Dispatcher<S, R> {
    /// Construct a dispatcher, registering the worktree-cleanup/ticket-closing
    /// listener on `merge_queue` before it is shared. The returned `MergeQueue`
    /// handle is the same instance the dispatcher enqueues onto; callers drive
    /// the independent merge tick through it.
    pub fn build(
        issue_store: Arc<S>,
        agent_runtime: Arc<R>,
        worktrees: Arc<WorktreeManager>,
        mut merge_queue: MergeQueue,
        config: ConvoyConfig,
    ) -> (Arc<Self>, Arc<MergeQueue>) {
        merge_queue.add_listener(Box::new(SessionCompletionListener {
            issue_store: Arc::clone(&issue_store),
            worktrees: Arc::clone(&worktrees),
        }));
        let merge_queue = Arc::new(merge_queue);
        let dispatcher = Arc::new(Self {
            issue_store,
            agent_runtime,
            worktrees,
            merge_queue: Arc::clone(&merge_queue),
            config,
            slots: Mutex::new(HashMap::new()),
        });
        (dispatcher, merge_queue)
    }

    #[cfg(test)]
    fn new_for_test(
        issue_store: Arc<S>,
        agent_runtime: Arc<R>,
        worktrees: Arc<WorktreeManager>,
        merge_queue: Arc<MergeQueue>,
        config: ConvoyConfig,
    ) -> Self {
        Self { issue_store, agent_runtime, worktrees, merge_queue, config, slots: Mutex::new(HashMap::new()) }
    }

    /// Reserve the lowest-numbered slot not already held by another building
    /// session. Returns `None` once every configured slot is occupied.
    fn reserve_slot(&self, issue_number: u64) -> Option<u32> {
        let mut slots = self.slots.lock().unwrap();
        let max = self.config.effective_max_slots();
        let occupied: BTreeSet<u32> = slots.values().copied().collect();
        let free = (0..max).find(|s| !occupied.contains(s))?;
        slots.insert(issue_number, free);
        Some(free)
    }

    fn release_slot(&self, issue_number: u64) {
        self.slots.lock().unwrap().remove(&issue_number);
    }

    /// `(frontend, backend)` port pair reserved for build slot `slot`.
    pub fn port_for_slot(&self, slot: u32) -> PortPair {
        let stride = self.config.general.port_offset_per_session * slot;
        PortPair {
            frontend: self.config.general.frontend_port_base.saturating_add(stride as u16),
            backend: self.config.general.backend_port_base.saturating_add(stride as u16),
        }
    }

    /// Count of tickets currently occupying a build slot.
    async fn building_count(&self) -> Result<usize> {
        let building = self
            .issue_store
            .list_open(Some(&[ticket::LABEL_BUILDING]))
            .await?;
        Ok(building.len())
    }

    pub async fn available_slots(&self) -> Result<u32> {
        let building = self.building_count().await? as u32;
        Ok(self.config.effective_max_slots().saturating_sub(building))
    }

    /// Refresh a ticket's derived vote/approver fields from its reactions.
    async fn hydrate(&self, mut ticket: Ticket) -> Result<Ticket> {
        let reactions = self.issue_store.list_reactions(ticket.number).await?;
        ticket.approvers = approvers_from_reactions(&reactions, &self.config.general.authorized_approvers);
        ticket.votes = votes_from_reactions(&reactions);
        Ok(ticket)
    }

    /// One admission pass: admits as many buildable tickets as there are free
    /// slots, starting each session in the background, and returns the
    /// ticket numbers admitted this tick.
    pub async fn tick(self: &Arc<Self>) -> Result<Vec<u64>> {
        let building_count = self.building_count().await?;
        let available = self.config.effective_max_slots().saturating_sub(building_count as u32);
        if available == 0 {
            return Ok(Vec::new());
        }

        let open = self.issue_store.list_open(None).await?;
        let mut hydrated = Vec::with_capacity(open.len());
        for t in open {
            hydrated.push(self.hydrate(t).await?);
        }
        let candidates = select_buildable(hydrated);

        let mut admitted = Vec::new();
        for candidate in candidates.into_iter().take(available as usize) {
            match self.admit(candidate).await {
                Ok(number) => admitted.push(number),
                Err(e) => warn!(error = %e, "failed to admit ticket"),
            }
        }
        Ok(admitted)
    }

    async fn admit(self: &Arc<Self>, ticket: Ticket) -> Result<u64> {
        let number = ticket.number;
        let Some(slot) = self.reserve_slot(number) else {
            return Err(crate::ConvoyError::Config("no free build slot available".into()));
        };

        match self.admit_on_slot(&ticket, slot).await {
            Ok(number) => Ok(number),
            Err(e) => {
                self.release_slot(number);
                Err(e)
            }
        }
    }

    async fn admit_on_slot(self: &Arc<Self>, ticket: &Ticket, slot: u32) -> Result<u64> {
        let number = ticket.number;
        let session_id = Uuid::new_v4().to_string();
        let ports = self.port_for_slot(slot);
        let is_rebuild = ticket.has_label(ticket::LABEL_REBUILDING);
        let start_time = Utc::now();

        info!(issue_number = number, session_id, slot, is_rebuild, "admitting ticket");

        let worktree = self
            .worktrees
            .create(number, &session_id, &self.config.worktree.base_branch)
            .await?;

        self.issue_store
            .remove_labels(number, &[ticket::LABEL_QUEUED, ticket::LABEL_REBUILDING])
            .await?;
        self.issue_store.add_labels(number, &[ticket::LABEL_BUILDING]).await?;
        self.issue_store
            .create_comment(
                number,
                &format!(
                    "Starting build on branch `{}` (frontend :{}, backend :{}). \
                     session: {session_id}, started: {start_time}, rebuild: {is_rebuild}.",
                    worktree.branch_name, ports.frontend, ports.backend
                ),
            )
            .await?;

        let this = Arc::clone(self);
        let worktree_path = worktree.path.clone();
        tokio::spawn(async move {
            let outcome = this
                .agent_runtime
                .spawn(number, &session_id, &worktree_path, ports)
                .await
                .unwrap_or_else(|e| AgentOutcome::Failed(e.to_string()));
            if let Err(e) = this.complete_ticket(number, outcome).await {
                warn!(issue_number = number, error = %e, "failed to record session completion");
            }
        });

        Ok(number)
    }

    /// Route a finished session: on success, hand the branch to the merge
    /// queue; on failure, surface the error on the ticket and free its slot.
    pub async fn complete_ticket(&self, issue_number: u64, outcome: AgentOutcome) -> Result<()> {
        self.release_slot(issue_number);
        self.issue_store
            .remove_labels(issue_number, &[ticket::LABEL_BUILDING])
            .await?;

        match outcome {
            AgentOutcome::Succeeded => {
                info!(issue_number, "session succeeded, enqueuing for merge");
                self.issue_store
                    .add_labels(issue_number, &[ticket::LABEL_MERGE_PENDING])
                    .await?;
                let branch = format!("issue-{issue_number}");
                self.merge_queue.enqueue(issue_number, Some(&branch))?;
            }
            AgentOutcome::Failed(message) => {
                warn!(issue_number, message, "session failed");
                self.issue_store
                    .add_labels(issue_number, &[ticket::LABEL_FAILED])
                    .await?;
                self.issue_store
                    .create_comment(issue_number, &format!("Build failed: {message}"))
                    .await?;
            }
        }
        Ok(())
    }
}
