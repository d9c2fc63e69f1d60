//! Environment sanity checks run before a long-lived tick loop is started.

use serde::Serialize;
use std::path::Path;
use std::process::Command;

use convoy_core::config::ConvoyConfig;

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub git: GitChecks,
    pub config: ConfigCheck,
    pub workspace_writable: bool,
}

impl DoctorReport {
    pub fn healthy(&self) -> bool {
        self.git.is_repo_capable && self.config.valid && self.workspace_writable
    }
}

#[derive(Debug, Serialize)]
pub struct GitChecks {
    pub binary_found: bool,
    pub version: Option<String>,
    /// True when the `git` binary works well enough to drive clone/worktree/merge.
    pub is_repo_capable: bool,
    pub error: Option<String>,
}

pub fn check_git() -> GitChecks {
    match Command::new("git").arg("--version").output() {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
            GitChecks {
                binary_found: true,
                version: Some(version),
                is_repo_capable: true,
                error: None,
            }
        }
        Ok(out) => GitChecks {
            binary_found: true,
            version: None,
            is_repo_capable: false,
            error: Some(String::from_utf8_lossy(&out.stderr).trim().to_string()),
        },
        Err(e) => GitChecks {
            binary_found: false,
            version: None,
            is_repo_capable: false,
            error: Some(e.to_string()),
        },
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigCheck {
    pub valid: bool,
    pub error: Option<String>,
}

pub fn check_config(cfg: &ConvoyConfig) -> ConfigCheck {
    match cfg.validate() {
        Ok(()) => ConfigCheck { valid: true, error: None },
        Err(e) => ConfigCheck { valid: false, error: Some(e.to_string()) },
    }
}

/// Attempt to create and remove a marker file under `workspace_root`.
pub fn check_workspace_writable(workspace_root: &Path) -> bool {
    if std::fs::create_dir_all(workspace_root).is_err() {
        return false;
    }
    let marker = workspace_root.join(".doctor-write-check");
    let writable = std::fs::write(&marker, b"ok").is_ok();
    let _ = std::fs::remove_file(&marker);
    writable
}

pub fn run(cfg: &ConvoyConfig) -> DoctorReport {
    DoctorReport {
        git: check_git(),
        config: check_config(cfg),
        workspace_writable: check_workspace_writable(&cfg.general.workspace_root),
    }
}

pub fn print_human_report(report: &DoctorReport) {
    println!("Convoy Doctor Report");
    println!("====================");
    println!();

    println!("Git:");
    if report.git.binary_found {
        println!("  Binary: found");
        if let Some(v) = &report.git.version {
            println!("  Version: {v}");
        }
    } else {
        println!("  Binary: NOT FOUND");
    }
    if let Some(err) = &report.git.error {
        println!("  Error: {err}");
    }

    println!();
    println!("Config:");
    println!("  Valid: {}", if report.config.valid { "yes" } else { "NO" });
    if let Some(err) = &report.config.error {
        println!("  Error: {err}");
    }

    println!();
    println!(
        "Workspace writable: {}",
        if report.workspace_writable { "yes" } else { "NO" }
    );

    println!();
    if report.healthy() {
        println!("Overall: HEALTHY");
    } else {
        println!("Overall: UNHEALTHY");
        if !report.git.is_repo_capable {
            println!("  - git is not usable");
        }
        if !report.config.valid {
            println!("  - config failed validation");
        }
        if !report.workspace_writable {
            println!("  - workspace root is not writable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_writable_detects_real_directory() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(check_workspace_writable(&tmp.path().join("nested")));
    }

    #[test]
    fn config_check_flags_invalid_repo_ref() {
        let cfg = ConvoyConfig::default();
        let check = check_config(&cfg);
        assert!(!check.valid);
        assert!(check.error.unwrap().contains("repo_ref"));
    }

    #[test]
    fn config_check_passes_valid_config() {
        let mut cfg = ConvoyConfig::default();
        cfg.general.repo_ref = "acme/widgets".into();
        let check = check_config(&cfg);
        assert!(check.valid);
    }
}
