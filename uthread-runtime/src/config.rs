//! Runtime Configuration
//!
//! Configuration for the TPS registry, semaphores, and logging. It can be set
//! programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `UTHREAD_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `UTHREAD_FAULT_DIAGNOSTICS` | Report faults on TPS pages ("true"/"false") | true |
//! | `UTHREAD_WAIT_LIST_CAPACITY` | Wait-list slots reserved per semaphore | 0 |
//! | `UTHREAD_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | warn |
//! | `UTHREAD_LOG_THREAD_IDS` | Include OS thread ids in log lines | false |
//!
//! # Example
//!
//! ```rust,ignore
//! use uthread_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .fault_diagnostics(false)
//!     .wait_list_capacity(16)
//!     .build()?;
//! ```

use std::env;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

/// Upper bound on the wait-list capacity reserved per semaphore.
pub const MAX_WAIT_LIST_CAPACITY: usize = 1 << 16;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors (default).
    #[default]
    Warn,
    /// Informational messages.
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Convert to a string representation, usable as a filter directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Ok(LogLevel::Off),
            "error" | "err" | "1" => Ok(LogLevel::Error),
            "warn" | "warning" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            _ => Err(ConfigError::InvalidValue {
                field: "log.level".into(),
                message: format!("unknown log level '{}'", s),
            }),
        }
    }
}

/// Thread-private storage configuration.
#[derive(Debug, Clone)]
pub struct TpsConfig {
    /// Install the fault handler that reports faults on TPS pages.
    /// Default: true.
    pub fault_diagnostics: bool,
}

impl Default for TpsConfig {
    fn default() -> Self {
        Self {
            fault_diagnostics: true,
        }
    }
}

/// Semaphore configuration.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Wait-list slots reserved when a semaphore is created.
    /// Default: 0 (grow on demand).
    pub wait_list_capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Log level. `RUST_LOG` overrides it when set.
    /// Default: Warn.
    pub level: LogLevel,

    /// Include OS thread ids in log output.
    /// Default: false.
    pub thread_ids: bool,
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Thread-private storage configuration.
    pub tps: TpsConfig,

    /// Semaphore configuration.
    pub sync: SyncConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set keep their default values. Values that do
    /// not parse, or that would fail validation, are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_bool("UTHREAD_FAULT_DIAGNOSTICS") {
            config.tps.fault_diagnostics = val;
        }

        if let Some(val) = parse_env_usize("UTHREAD_WAIT_LIST_CAPACITY") {
            if val <= MAX_WAIT_LIST_CAPACITY {
                config.sync.wait_list_capacity = val;
            } else {
                warn!(
                    value = val,
                    max = MAX_WAIT_LIST_CAPACITY,
                    "ignoring UTHREAD_WAIT_LIST_CAPACITY above the maximum"
                );
            }
        }

        if let Ok(val) = env::var("UTHREAD_LOG_LEVEL") {
            match val.parse() {
                Ok(level) => config.log.level = level,
                Err(err) => warn!(%err, "ignoring UTHREAD_LOG_LEVEL"),
            }
        }

        if let Some(val) = parse_env_bool("UTHREAD_LOG_THREAD_IDS") {
            config.log.thread_ids = val;
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.wait_list_capacity > MAX_WAIT_LIST_CAPACITY {
            return Err(ConfigError::InvalidValue {
                field: "sync.wait_list_capacity".into(),
                message: format!("must be at most {}", MAX_WAIT_LIST_CAPACITY),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the TPS fault handler.
    pub fn fault_diagnostics(mut self, enabled: bool) -> Self {
        self.config.tps.fault_diagnostics = enabled;
        self
    }

    /// Set the wait-list capacity reserved per semaphore.
    pub fn wait_list_capacity(mut self, capacity: usize) -> Self {
        self.config.sync.wait_list_capacity = capacity;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Include OS thread ids in log output.
    pub fn log_thread_ids(mut self, enabled: bool) -> Self {
        self.config.log.thread_ids = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Use this only if you're certain the configuration is valid.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(val) => Some(val),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring non-numeric environment variable");
            None
        }
    }
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|s| match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => {
                warn!(var = name, value = %s, "ignoring non-boolean environment variable");
                None
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.tps.fault_diagnostics);
        assert_eq!(config.sync.wait_list_capacity, 0);
        assert_eq!(config.log.level, LogLevel::Warn);
        assert!(!config.log.thread_ids);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .fault_diagnostics(false)
            .wait_list_capacity(32)
            .log_level(LogLevel::Debug)
            .log_thread_ids(true)
            .build()
            .unwrap();

        assert!(!config.tps.fault_diagnostics);
        assert_eq!(config.sync.wait_list_capacity, 32);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert!(config.log.thread_ids);
    }

    #[test]
    fn test_builder_validation() {
        let result = RuntimeConfig::builder()
            .wait_list_capacity(MAX_WAIT_LIST_CAPACITY + 1)
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("sync.wait_list_capacity"));

        let config = RuntimeConfig::builder()
            .wait_list_capacity(MAX_WAIT_LIST_CAPACITY + 1)
            .build_unchecked();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("off".parse(), Ok(LogLevel::Off));
        assert_eq!("ERROR".parse(), Ok(LogLevel::Error));
        assert_eq!("warning".parse(), Ok(LogLevel::Warn));
        assert_eq!("INFO".parse(), Ok(LogLevel::Info));
        assert_eq!("4".parse(), Ok(LogLevel::Debug));
        assert_eq!("TRACE".parse(), Ok(LogLevel::Trace));
        assert!("invalid".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "sync.wait_list_capacity".into(),
            message: "must be small".into(),
        };
        assert!(err.to_string().contains("sync.wait_list_capacity"));
        assert!(err.to_string().contains("must be small"));
    }

    // ========================================================================
    // Environment
    // ========================================================================

    // getenv is not synchronised with setenv, so the environment is set up
    // per child process and never mutated inside the test binary.

    const CHILD_ENV: &str = "UTHREAD_CONFIG_CHILD";
    const VARS: [&str; 4] = [
        "UTHREAD_FAULT_DIAGNOSTICS",
        "UTHREAD_WAIT_LIST_CAPACITY",
        "UTHREAD_LOG_LEVEL",
        "UTHREAD_LOG_THREAD_IDS",
    ];

    fn in_child() -> bool {
        env::var_os(CHILD_ENV).is_some()
    }

    fn run_in_child(test_name: &str, vars: &[(&str, String)]) {
        let exe = env::current_exe().unwrap();
        let mut cmd = std::process::Command::new(exe);
        cmd.args([test_name, "--exact", "--test-threads=1"])
            .env(CHILD_ENV, "1");
        for var in VARS {
            cmd.env_remove(var);
        }
        for (var, val) in vars {
            cmd.env(var, val);
        }

        let output = cmd.output().unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            output.status.success(),
            "{} failed: {}\n{}",
            test_name,
            stdout,
            String::from_utf8_lossy(&output.stderr)
        );
        assert!(stdout.contains("1 passed"), "{} did not run: {}", test_name, stdout);
    }

    #[test]
    fn child_from_env_defaults() {
        if !in_child() {
            return;
        }
        let config = RuntimeConfig::from_env();
        assert!(config.tps.fault_diagnostics);
        assert_eq!(config.sync.wait_list_capacity, 0);
        assert_eq!(config.log.level, LogLevel::Warn);
        assert!(!config.log.thread_ids);
    }

    #[test]
    fn child_from_env_overrides() {
        if !in_child() {
            return;
        }
        let config = RuntimeConfig::from_env();
        assert!(!config.tps.fault_diagnostics);
        assert_eq!(config.sync.wait_list_capacity, 8);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert!(config.log.thread_ids);
    }

    #[test]
    fn child_from_env_ignores_invalid() {
        if !in_child() {
            return;
        }
        let config = RuntimeConfig::from_env();
        assert!(config.tps.fault_diagnostics);
        assert_eq!(config.sync.wait_list_capacity, 0);
        assert_eq!(config.log.level, LogLevel::Warn);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_with_no_vars() {
        if in_child() {
            return;
        }
        run_in_child("config::tests::child_from_env_defaults", &[]);
    }

    #[test]
    fn test_from_env_overrides_defaults() {
        if in_child() {
            return;
        }
        run_in_child(
            "config::tests::child_from_env_overrides",
            &[
                ("UTHREAD_FAULT_DIAGNOSTICS", "off".into()),
                ("UTHREAD_WAIT_LIST_CAPACITY", "8".into()),
                ("UTHREAD_LOG_LEVEL", "debug".into()),
                ("UTHREAD_LOG_THREAD_IDS", "yes".into()),
            ],
        );
    }

    #[test]
    fn test_from_env_ignores_invalid_values() {
        if in_child() {
            return;
        }
        run_in_child(
            "config::tests::child_from_env_ignores_invalid",
            &[
                ("UTHREAD_FAULT_DIAGNOSTICS", "maybe".into()),
                ("UTHREAD_WAIT_LIST_CAPACITY", (MAX_WAIT_LIST_CAPACITY + 1).to_string()),
                ("UTHREAD_LOG_LEVEL", "loud".into()),
            ],
        );
    }
}
