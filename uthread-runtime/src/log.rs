//! Logging Infrastructure
//!
//! The runtime emits structured events through the `tracing` facade. This
//! module installs a `tracing-subscriber` formatter for processes that do
//! not set up their own.
//!
//! `RUST_LOG` takes precedence over the configured level when it is set and
//! parses. A subscriber that is already installed, by this module or by the
//! embedding program, is left in place.
//!
//! # Example
//!
//! ```rust,ignore
//! use uthread_runtime::config::LogConfig;
//! use uthread_runtime::log;
//!
//! log::init(&LogConfig::default());
//! ```

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Build the filter for `config`, honouring `RUST_LOG` when present.
pub fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Install a stderr formatting subscriber configured by `config`.
///
/// Returns false if a global subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(config))
        .with_thread_ids(config.thread_ids)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
