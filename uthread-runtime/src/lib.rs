//! # uthread Runtime Library
//!
//! Synchronization and storage services for a cooperative thread runtime:
//!
//! - **Semaphores**: counting semaphores whose blocked threads are woken in
//!   the order they started waiting
//! - **Thread-Private Storage**: one protected page per thread, reachable
//!   only through bounded reads and writes, shareable between threads with
//!   copy-on-write
//! - **Fault Diagnostics**: faults on TPS pages are reported before the
//!   process dies
//! - **FFI Support**: C ABI over a process-wide instance
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       UTHREAD RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Semaphore   │  │ TPS Registry │  │  C exports   │          │
//! │  │  (sync.rs)   │  │   (tps.rs)   │  │(ffi_exports) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                                     │
//! │         ├─────────────────┤                                     │
//! │         │                 │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Scheduler   │  │     Page     │──│ Fault handler│          │
//! │  │(scheduler.rs)│  │  (page.rs)   │  │ (signal.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use uthread_runtime::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let sem = runtime.semaphore(1)?;
//! sem.down()?;
//!
//! runtime.tps().create()?;
//! runtime.tps().write(0, 5, b"hello")?;
//! sem.up()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod ffi_exports;
pub mod log;
pub mod page;
pub mod queue;
pub mod scheduler;
pub mod signal;
pub mod sync;
pub mod tps;

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

// Re-exports
pub use config::{ConfigError, LogConfig, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use error::ErrorKind;
pub use page::{Page, PageError, Protection, TPS_SIZE};
pub use queue::{Queue, QueueError};
pub use scheduler::{CriticalSection, Scheduler, Tid};
pub use sync::{Semaphore, SemaphoreError};
pub use tps::{TpsError, TpsRegistry};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error returned when a [`Runtime`] cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The TPS registry could not be initialized.
    #[error(transparent)]
    Tps(#[from] TpsError),
}

impl RuntimeError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Config(_) => ErrorKind::Validation,
            RuntimeError::Tps(err) => err.kind(),
        }
    }
}

/// A scheduler, an initialized TPS registry, and the configuration they
/// were built from.
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    scheduler: Arc<Scheduler>,
    tps: TpsRegistry,
}

impl Runtime {
    /// Build a runtime with its own scheduler.
    ///
    /// The configuration is validated and the TPS registry initialized,
    /// installing the fault handler if `config.tps.fault_diagnostics` is set.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_scheduler(config, Arc::new(Scheduler::new()))
    }

    /// Build a runtime on an existing scheduler.
    pub fn with_scheduler(
        config: RuntimeConfig,
        scheduler: Arc<Scheduler>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let tps = TpsRegistry::new(Arc::clone(&scheduler));
        tps.init(config.tps.fault_diagnostics)?;
        info!(
            version = VERSION,
            fault_diagnostics = config.tps.fault_diagnostics,
            wait_list_capacity = config.sync.wait_list_capacity,
            "runtime initialized"
        );

        Ok(Self {
            config,
            scheduler,
            tps,
        })
    }

    /// Build a runtime from `UTHREAD_*` environment variables, installing
    /// the log subscriber they describe.
    ///
    /// See [`RuntimeConfig::from_env`] for the supported variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        let config = RuntimeConfig::from_env();
        log::init(&config.log);
        Self::new(config)
    }

    /// Create a semaphore with `count` units, its wait list sized by the
    /// sync configuration.
    pub fn semaphore(&self, count: usize) -> Result<Semaphore, SemaphoreError> {
        Semaphore::with_wait_capacity(
            Arc::clone(&self.scheduler),
            count,
            self.config.sync.wait_list_capacity,
        )
    }

    /// The TPS registry.
    pub fn tps(&self) -> &TpsRegistry {
        &self.tps
    }

    /// The scheduler shared by this runtime's semaphores and registry.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The configuration this runtime was built from.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> RuntimeConfig {
        RuntimeConfig::builder()
            .fault_diagnostics(false)
            .wait_list_capacity(4)
            .build()
            .unwrap()
    }

    #[test]
    fn test_runtime_initializes_registry() {
        let runtime = Runtime::new(quiet_config()).unwrap();
        assert!(runtime.tps().is_initialized());
        assert_eq!(runtime.config().sync.wait_list_capacity, 4);
        assert_eq!(
            runtime.tps().init(false),
            Err(TpsError::AlreadyInitialized)
        );
    }

    #[test]
    fn test_runtime_rejects_invalid_config() {
        let config = RuntimeConfig::builder()
            .wait_list_capacity(config::MAX_WAIT_LIST_CAPACITY + 1)
            .build_unchecked();
        let err = Runtime::new(config).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_runtime_semaphore_shares_scheduler() {
        let runtime = Runtime::new(quiet_config()).unwrap();
        let sem = runtime.semaphore(1).unwrap();
        assert_eq!(sem.count().unwrap(), 1);
        assert!(sem.try_down().unwrap());

        runtime.tps().create().unwrap();
        runtime.tps().write(0, 2, b"ok").unwrap();
        sem.up().unwrap();
        sem.destroy().unwrap();
    }
}
