//! The `AgentRuntime` capability: the opaque external collaborator that
//! actually writes code inside a worktree. The core only knows that an
//! invocation started and, eventually, that it terminated with an outcome --
//! it never inspects what the agent did in between.

use async_trait::async_trait;

use crate::Result;

/// Ports reserved for one session's frontend/backend dev servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub frontend: u16,
    pub backend: u16,
}

/// The terminal result of an agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Succeeded,
    Failed(String),
}

/// Abstract capability over the agent runtime. Production implementations
/// spawn and supervise the actual coding-agent process; this crate depends
/// only on the trait.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn spawn(
        &self,
        issue_number: u64,
        session_id: &str,
        worktree_path: &std::path::Path,
        ports: PortPair,
    ) -> Result<AgentOutcome>;
}
