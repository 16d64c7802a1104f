//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! classify failures from trajectory validation, hardware access, the flyer
//! state machine and the live data pipeline.
//!
//! ## Error Taxonomy
//!
//! - **`Configuration`**: an invalid scan specification or setting. Fatal for the
//!   scan that requested it; the scan never starts.
//! - **`DeviceTimeout`**: the hardware did not acknowledge a read or write in time.
//!   Reads are retried a small fixed number of times before this is raised; writes
//!   and motion surface it immediately and abort the scan.
//! - **`ProtocolViolation`**: the flyer was driven out of order. This is a
//!   programming error in the caller.
//! - **`DataUnavailable`**: a run is missing fields or has no finite samples yet.
//!   The pipeline skips the affected slot for this tick and tries again next tick.
//! - **`Aborted`**: the operator requested an abort and a checkpoint observed it.
//!
//! Driver seams return `anyhow::Result`; the device I/O layer maps those failures
//! into `Device` or `DeviceTimeout`.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Layered configuration could not be loaded.
    #[error("Configuration load error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Invalid scan specification or configuration value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Hardware did not acknowledge an operation before its timeout.
    #[error("Device timeout: {operation} ({attempts} attempt(s))")]
    DeviceTimeout {
        /// Human readable description of the operation, e.g. `read MotionDone`.
        operation: String,
        /// Number of attempts that were made before giving up.
        attempts: u32,
    },

    /// Driver-reported failure that is not a timeout.
    #[error("Device error: {0}")]
    Device(String),

    /// Flyer operation called from the wrong state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Missing fields or no usable samples for a run.
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// Scan interrupted by an abort request.
    #[error("Scan aborted")]
    Aborted,

    /// Event bus transport failure.
    #[error("Event bus error: {0}")]
    Bus(String),

    /// I/O error, mostly from the bus sockets.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cleanup finished with one or more failed steps.
    #[error("Cleanup failed with {} error(s)", .0.len())]
    CleanupFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Shorthand for a [`DaqError::DeviceTimeout`].
    pub fn timeout(operation: impl Into<String>, attempts: u32) -> Self {
        DaqError::DeviceTimeout {
            operation: operation.into(),
            attempts,
        }
    }

    /// True for errors the live pipeline treats as "try again next tick".
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaqError::DataUnavailable(_) | DaqError::DeviceTimeout { .. }
        )
    }
}
