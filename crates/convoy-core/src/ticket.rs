//! Ticket data model and lifecycle labels.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LABEL_QUEUED: &str = "queued";
pub const LABEL_BUILDING: &str = "agent-building";
pub const LABEL_MERGE_PENDING: &str = "merge-pending";
pub const LABEL_MERGE_CONFLICT: &str = "merge-conflict";
pub const LABEL_FAILED: &str = "tests-failed";
pub const LABEL_REBUILDING: &str = "rebuilding";
pub const LABEL_COMPLETE: &str = "agent-complete";
pub const LABEL_DEPLOYED: &str = "deployed";

/// Reaction kinds that count as staff approval.
pub const APPROVAL_REACTIONS: &[&str] = &["rocket", "hooray"];

/// A ticket mirrored from the external issue tracker. Never mutated in
/// place; transitions are expressed as fresh label sets applied by the
/// `IssueStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: BTreeSet<String>,
    pub votes: u32,
    pub approvers: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Ticket {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// A ticket is buildable iff it has at least one approver and carries
    /// neither the building nor the complete label.
    pub fn is_buildable(&self) -> bool {
        !self.approvers.is_empty()
            && !self.has_label(LABEL_BUILDING)
            && !self.has_label(LABEL_COMPLETE)
    }
}

/// Sort buildable tickets by `(-votes, created_at ascending)`, stable on ties.
pub fn select_buildable(mut tickets: Vec<Ticket>) -> Vec<Ticket> {
    tickets.retain(Ticket::is_buildable);
    tickets.sort_by(|a, b| b.votes.cmp(&a.votes).then(a.created_at.cmp(&b.created_at)));
    tickets
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ticket(number: u64, votes: u32, created_at: i64, approvers: &[&str], labels: &[&str]) -> Ticket {
        Ticket {
            number,
            title: format!("ticket {number}"),
            body: String::new(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            votes,
            approvers: approvers.iter().map(|s| s.to_string()).collect(),
            created_at: Utc.timestamp_opt(created_at, 0).unwrap(),
        }
    }

    #[test]
    fn not_buildable_without_approver() {
        let t = ticket(1, 5, 100, &[], &[]);
        assert!(!t.is_buildable());
    }

    #[test]
    fn not_buildable_while_building_or_complete() {
        let building = ticket(1, 1, 100, &["alice"], &[LABEL_BUILDING]);
        let complete = ticket(2, 1, 100, &["alice"], &[LABEL_COMPLETE]);
        assert!(!building.is_buildable());
        assert!(!complete.is_buildable());
    }

    #[test]
    fn buildable_with_approver_and_no_blocking_label() {
        let t = ticket(1, 1, 100, &["alice"], &[LABEL_QUEUED]);
        assert!(t.is_buildable());
    }

    #[test]
    fn selection_orders_by_votes_desc_then_created_asc() {
        let a = ticket(10, 1, 200, &["alice"], &[]);
        let b = ticket(11, 5, 300, &["alice"], &[]);
        let c = ticket(12, 5, 100, &["alice"], &[]);
        let selected = select_buildable(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(selected.iter().map(|t| t.number).collect::<Vec<_>>(), vec![12, 11, 10]);
    }

    #[test]
    fn selection_drops_non_buildable() {
        let buildable = ticket(1, 1, 100, &["alice"], &[]);
        let not = ticket(2, 9, 50, &[], &[]);
        let selected = select_buildable(vec![buildable, not]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].number, 1);
    }
}
