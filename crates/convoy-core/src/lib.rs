pub mod agent_runtime;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod git_exec;
pub mod issue_store;
pub mod merge;
pub mod merge_queue;
pub mod provision;
pub mod security;
pub mod ticket;
pub mod worktree;

pub use error::{ConvoyError, Result};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("convoy tracing initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ConvoyError::Config("missing field".into());
        assert_eq!(err.to_string(), "config error: missing field");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let convoy_err: ConvoyError = io_err.into();
        assert!(matches!(convoy_err, ConvoyError::Io(_)));
    }
}
