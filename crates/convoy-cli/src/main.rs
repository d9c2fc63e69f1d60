mod doctor;
mod queue;

use anyhow::Result;
use clap::{Parser, Subcommand};

use convoy_core::config::ConvoyConfig;

#[derive(Parser)]
#[command(name = "convoy", version, about = "Ticket-to-merge coordination core")]
struct Cli {
    /// Path to a convoy.toml config file. Defaults to ./convoy.toml, falling
    /// back to built-in defaults when absent.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Emit machine-readable JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sanity-check the runtime environment before starting a long-running loop.
    Doctor,
    /// Clone or refresh the shared base repository every worktree forks from.
    Provision,
    /// Inspect or drive the durable merge queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Report queue length and pause state.
    Status,
    /// Clear a sticky pause so the next `process` attempt can run.
    Resume,
    /// Attempt up to `--max` head-of-queue merges.
    Process {
        #[arg(long, default_value_t = 1)]
        max: usize,
    },
}

fn load_config(path: Option<&std::path::Path>) -> ConvoyConfig {
    match path {
        Some(p) => ConvoyConfig::load(p).unwrap_or_else(|e| {
            tracing::error!(%e, path = %p.display(), "failed to load config");
            std::process::exit(1);
        }),
        None => ConvoyConfig::load_or_default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    convoy_core::init_tracing();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref());

    match cli.command {
        Command::Doctor => {
            let report = doctor::run(&cfg);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                doctor::print_human_report(&report);
            }
            if !report.healthy() {
                std::process::exit(1);
            }
        }
        Command::Provision => {
            let token = queue::github_token()?;
            let path = convoy_core::provision::ensure_base_repo(
                &cfg.general.repo_ref,
                &token,
                &cfg.base_repo_dir(),
                std::time::Duration::from_secs(cfg.git.command_timeout_seconds),
            )
            .await?;
            println!("base repository ready at {}", path.display());
        }
        Command::Queue { action } => {
            let q = queue::build_queue(&cfg)?;
            match action {
                QueueAction::Status => {
                    let status = queue::status(&q)?;
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&status)?);
                    } else {
                        queue::print_status(&status);
                    }
                }
                QueueAction::Resume => {
                    let resumed = q.resume()?;
                    if resumed {
                        println!("queue resumed");
                    } else {
                        println!("queue was not paused");
                    }
                }
                QueueAction::Process { max } => {
                    let results = q.process_queue(max).await?;
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&results)?);
                    } else {
                        queue::print_process_results(&results);
                    }
                }
            }
        }
    }

    Ok(())
}
