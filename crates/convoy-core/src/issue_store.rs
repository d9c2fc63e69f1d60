//! The `IssueStore` capability: the narrow surface the coordination core
//! needs from an external issue tracker. The production client (HTTP, auth,
//! pagination) lives outside this crate; only the trait and a test fake live
//! here.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::ticket::Ticket;
use crate::Result;

/// A single reaction left by a principal on a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub principal: String,
    pub kind: String,
}

/// Abstract capability over the external issue tracker. The core depends
/// only on this trait, never on a concrete tracker client.
#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn list_open(&self, labels: Option<&[&str]>) -> Result<Vec<Ticket>>;
    async fn get(&self, number: u64) -> Result<Ticket>;
    async fn add_labels(&self, number: u64, labels: &[&str]) -> Result<()>;
    async fn remove_labels(&self, number: u64, labels: &[&str]) -> Result<()>;
    async fn create_comment(&self, number: u64, body: &str) -> Result<()>;
    async fn close(&self, number: u64) -> Result<()>;
    async fn list_reactions(&self, number: u64) -> Result<Vec<Reaction>>;
}

/// In-memory `IssueStore` used by tests. Not built for production traffic.
#[derive(Default)]
pub struct FakeIssueStore {
    tickets: Mutex<HashMap<u64, Ticket>>,
    reactions: Mutex<HashMap<u64, Vec<Reaction>>>,
    comments: Mutex<HashMap<u64, Vec<String>>>,
    closed: Mutex<BTreeSet<u64>>,
}

impl FakeIssueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ticket: Ticket) {
        self.tickets.lock().unwrap().insert(ticket.number, ticket);
    }

    pub fn add_reaction(&self, number: u64, principal: &str, kind: &str) {
        self.reactions
            .lock()
            .unwrap()
            .entry(number)
            .or_default()
            .push(Reaction { principal: principal.to_string(), kind: kind.to_string() });
    }

    pub fn comments_for(&self, number: u64) -> Vec<String> {
        self.comments.lock().unwrap().get(&number).cloned().unwrap_or_default()
    }

    pub fn is_closed(&self, number: u64) -> bool {
        self.closed.lock().unwrap().contains(&number)
    }
}

#[async_trait]
impl IssueStore for FakeIssueStore {
    async fn list_open(&self, labels: Option<&[&str]>) -> Result<Vec<Ticket>> {
        let closed = self.closed.lock().unwrap();
        let tickets = self.tickets.lock().unwrap();
        Ok(tickets
            .values()
            .filter(|t| !closed.contains(&t.number))
            .filter(|t| match labels {
                Some(ls) => ls.iter().all(|l| t.labels.contains(*l)),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn get(&self, number: u64) -> Result<Ticket> {
        self.tickets
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| crate::ConvoyError::TrackerUnavailable(format!("no such ticket #{number}")))
    }

    async fn add_labels(&self, number: u64, labels: &[&str]) -> Result<()> {
        let mut tickets = self.tickets.lock().unwrap();
        if let Some(t) = tickets.get_mut(&number) {
            for l in labels {
                t.labels.insert(l.to_string());
            }
        }
        Ok(())
    }

    async fn remove_labels(&self, number: u64, labels: &[&str]) -> Result<()> {
        let mut tickets = self.tickets.lock().unwrap();
        if let Some(t) = tickets.get_mut(&number) {
            for l in labels {
                t.labels.remove(*l);
            }
        }
        Ok(())
    }

    async fn create_comment(&self, number: u64, body: &str) -> Result<()> {
        self.comments.lock().unwrap().entry(number).or_default().push(body.to_string());
        Ok(())
    }

    async fn close(&self, number: u64) -> Result<()> {
        self.closed.lock().unwrap().insert(number);
        Ok(())
    }

    async fn list_reactions(&self, number: u64) -> Result<Vec<Reaction>> {
        Ok(self.reactions.lock().unwrap().get(&number).cloned().unwrap_or_default())
    }
}

/// Staff approval is any `rocket`/`hooray` reaction from a principal in the
/// authorized-approvers set; the up-vote count is the number of `+1`s.
pub fn approvers_from_reactions(
    reactions: &[Reaction],
    authorized: &BTreeSet<String>,
) -> BTreeSet<String> {
    reactions
        .iter()
        .filter(|r| crate::ticket::APPROVAL_REACTIONS.contains(&r.kind.as_str()))
        .filter(|r| authorized.contains(&r.principal))
        .map(|r| r.principal.clone())
        .collect()
}

pub fn votes_from_reactions(reactions: &[Reaction]) -> u32 {
    reactions.iter().filter(|r| r.kind == "+1").count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approvers_filters_to_authorized_and_approval_kinds() {
        let reactions = vec![
            Reaction { principal: "alice".into(), kind: "rocket".into() },
            Reaction { principal: "mallory".into(), kind: "rocket".into() },
            Reaction { principal: "bob".into(), kind: "+1".into() },
        ];
        let authorized: BTreeSet<String> = ["alice", "bob"].iter().map(|s| s.to_string()).collect();
        let approvers = approvers_from_reactions(&reactions, &authorized);
        assert_eq!(approvers.len(), 1);
        assert!(approvers.contains("alice"));
    }

    #[test]
    fn votes_counts_only_plus_one() {
        let reactions = vec![
            Reaction { principal: "a".into(), kind: "+1".into() },
            Reaction { principal: "b".into(), kind: "+1".into() },
            Reaction { principal: "c".into(), kind: "rocket".into() },
        ];
        assert_eq!(votes_from_reactions(&reactions), 2);
    }

    #[tokio::test]
    async fn fake_store_round_trip() {
        let store = FakeIssueStore::new();
        store.insert(Ticket {
            number: 1,
            title: "t".into(),
            body: String::new(),
            labels: BTreeSet::new(),
            votes: 0,
            approvers: BTreeSet::new(),
            created_at: chrono::Utc::now(),
        });
        store.add_labels(1, &["queued"]).await.unwrap();
        let t = store.get(1).await.unwrap();
        assert!(t.labels.contains("queued"));

        store.remove_labels(1, &["queued"]).await.unwrap();
        let t = store.get(1).await.unwrap();
        assert!(!t.labels.contains("queued"));

        store.create_comment(1, "hello").await.unwrap();
        assert_eq!(store.comments_for(1), vec!["hello".to_string()]);

        store.close(1).await.unwrap();
        assert!(store.is_closed(1));
        assert!(store.list_open(None).await.unwrap().is_empty());
    }
}
