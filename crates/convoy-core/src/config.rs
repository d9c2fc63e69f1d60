use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{ConvoyError, Result};

/// Top-level, immutable configuration. Loaded once at startup and threaded
/// through constructors; never re-read from the environment mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvoyConfig {
    pub general: GeneralConfig,
    pub worktree: WorktreeConfig,
    pub git: GitConfig,
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            worktree: WorktreeConfig::default(),
            git: GitConfig::default(),
        }
    }
}

impl ConvoyConfig {
    /// Load config from a specific `convoy.toml` file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConvoyError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConvoyError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `./convoy.toml` if it exists, otherwise return defaults.
    pub fn load_or_default() -> Self {
        let path = PathBuf::from("convoy.toml");
        if path.exists() {
            match Self::load(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(%e, "failed to load convoy.toml, falling back to defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }

    /// The effective number of build slots, collapsing to 1 when parallel
    /// mode is disabled regardless of the configured `max_slots`.
    pub fn effective_max_slots(&self) -> u32 {
        if self.general.parallel_mode {
            self.general.max_slots
        } else {
            1
        }
    }

    pub fn base_repo_dir(&self) -> PathBuf {
        self.general.workspace_root.join("base-repo")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.general.workspace_root.join("worktrees")
    }

    pub fn session_state_dir(&self) -> PathBuf {
        self.general.workspace_root.join("session-state")
    }

    /// Validate the config and return actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.general.max_slots == 0 {
            return Err(ConvoyError::Config("general.max_slots must be >= 1".into()));
        }
        if self.general.port_offset_per_session == 0 {
            return Err(ConvoyError::Config(
                "general.port_offset_per_session must be > 0".into(),
            ));
        }
        if self.general.repo_ref.trim().is_empty() {
            return Err(ConvoyError::Config("general.repo_ref must not be empty".into()));
        }
        if !self.general.repo_ref.contains('/') {
            return Err(ConvoyError::Config(format!(
                "general.repo_ref '{}' must be in 'owner/name' form",
                self.general.repo_ref
            )));
        }
        for (i, a) in self.general.authorized_approvers.iter().enumerate() {
            if a.trim().is_empty() {
                return Err(ConvoyError::Config(format!(
                    "general.authorized_approvers[{i}] is empty"
                )));
            }
        }
        if self.worktree.stale_max_age_hours == 0 {
            return Err(ConvoyError::Config(
                "worktree.stale_max_age_hours must be > 0".into(),
            ));
        }
        if self.git.command_timeout_seconds == 0 {
            return Err(ConvoyError::Config(
                "git.command_timeout_seconds must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GeneralConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Whether more than one session may build concurrently.
    pub parallel_mode: bool,
    /// Maximum parallel build slots when `parallel_mode` is true.
    pub max_slots: u32,
    /// Port stride applied per slot index to derive disjoint frontend/backend ports.
    pub port_offset_per_session: u32,
    pub frontend_port_base: u16,
    pub backend_port_base: u16,
    /// Root directory under which `base-repo/`, `worktrees/`, and `session-state/` live.
    pub workspace_root: PathBuf,
    /// Staff principals whose reactions count as ticket approval.
    pub authorized_approvers: BTreeSet<String>,
    /// `owner/name` of the managed repository.
    pub repo_ref: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            parallel_mode: true,
            max_slots: 3,
            port_offset_per_session: 10,
            frontend_port_base: 6174,
            backend_port_base: 4001,
            workspace_root: PathBuf::from("./.convoy"),
            authorized_approvers: BTreeSet::new(),
            repo_ref: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorktreeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Age threshold (hours) beyond which `CleanupStale` removes a worktree.
    pub stale_max_age_hours: u64,
    /// Base branch new ticket branches are created off of.
    pub base_branch: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            stale_max_age_hours: 24,
            base_branch: "main".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// GitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Per-subprocess wall-clock timeout, in seconds.
    pub command_timeout_seconds: u64,
    /// Identity configured in new worktree checkouts.
    pub author_name: String,
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            command_timeout_seconds: 300,
            author_name: "convoy-bot".into(),
            author_email: "convoy-bot@users.noreply.github.com".into(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_TOML: &str = r#"
[general]
parallel_mode = true
max_slots = 4
port_offset_per_session = 20
frontend_port_base = 6174
backend_port_base = 4001
workspace_root = "/tmp/convoy-workspace"
authorized_approvers = ["alice", "bob"]
repo_ref = "acme/widgets"

[worktree]
stale_max_age_hours = 12
base_branch = "trunk"

[git]
command_timeout_seconds = 120
author_name = "convoy-bot"
author_email = "convoy-bot@users.noreply.github.com"
"#;

    #[test]
    fn parse_full_toml() {
        let cfg: ConvoyConfig = toml::from_str(FULL_TOML).expect("parse full TOML");
        assert!(cfg.general.parallel_mode);
        assert_eq!(cfg.general.max_slots, 4);
        assert_eq!(cfg.general.port_offset_per_session, 20);
        assert_eq!(
            cfg.general.workspace_root,
            PathBuf::from("/tmp/convoy-workspace")
        );
        assert_eq!(cfg.general.authorized_approvers.len(), 2);
        assert_eq!(cfg.general.repo_ref, "acme/widgets");
        assert_eq!(cfg.worktree.stale_max_age_hours, 12);
        assert_eq!(cfg.worktree.base_branch, "trunk");
        assert_eq!(cfg.git.command_timeout_seconds, 120);
        cfg.validate().expect("full config is valid");
    }

    #[test]
    fn parse_minimal_toml_gets_defaults() {
        let cfg: ConvoyConfig = toml::from_str("").expect("parse empty TOML");
        assert!(cfg.general.parallel_mode);
        assert_eq!(cfg.general.max_slots, 3);
        assert_eq!(cfg.general.port_offset_per_session, 10);
        assert_eq!(cfg.worktree.stale_max_age_hours, 24);
        assert_eq!(cfg.worktree.base_branch, "main");
        assert_eq!(cfg.git.command_timeout_seconds, 300);
    }

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let partial = r#"
[general]
max_slots = 8
repo_ref = "acme/widgets"
"#;
        let cfg: ConvoyConfig = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.general.max_slots, 8);
        assert_eq!(cfg.general.port_offset_per_session, 10);
        assert_eq!(cfg.worktree.stale_max_age_hours, 24);
        cfg.validate().expect("partial config is valid");
    }

    #[test]
    fn validate_rejects_zero_max_slots() {
        let mut cfg = ConvoyConfig::default();
        cfg.general.max_slots = 0;
        cfg.general.repo_ref = "acme/widgets".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_slots"));
    }

    #[test]
    fn validate_rejects_empty_repo_ref() {
        let cfg = ConvoyConfig::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("repo_ref"));
    }

    #[test]
    fn validate_rejects_repo_ref_without_slash() {
        let mut cfg = ConvoyConfig::default();
        cfg.general.repo_ref = "widgets".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("owner/name"));
    }

    #[test]
    fn validate_rejects_zero_stale_age() {
        let mut cfg = ConvoyConfig::default();
        cfg.general.repo_ref = "acme/widgets".into();
        cfg.worktree.stale_max_age_hours = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("stale_max_age_hours"));
    }

    #[test]
    fn effective_max_slots_collapses_in_sequential_mode() {
        let mut cfg = ConvoyConfig::default();
        cfg.general.parallel_mode = false;
        cfg.general.max_slots = 5;
        assert_eq!(cfg.effective_max_slots(), 1);
    }

    #[test]
    fn serialization_round_trip() {
        let mut original = ConvoyConfig::default();
        original.general.repo_ref = "acme/widgets".into();
        let toml_str = toml::to_string_pretty(&original).expect("serialize");
        let restored: ConvoyConfig = toml::from_str(&toml_str).expect("deserialize");

        assert_eq!(original.general.max_slots, restored.general.max_slots);
        assert_eq!(original.general.repo_ref, restored.general.repo_ref);
        assert_eq!(
            original.worktree.stale_max_age_hours,
            restored.worktree.stale_max_age_hours
        );
        restored.validate().expect("round-tripped config is valid");
    }

    #[test]
    fn parse_invalid_toml_returns_error() {
        let bad = "this is not [valid toml";
        let result = toml::from_str::<ConvoyConfig>(bad);
        assert!(result.is_err());
    }
}
