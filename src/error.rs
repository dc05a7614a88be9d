//! Error types for the capture core.
//!
//! This module provides the error type that covers the failure modes of the
//! capture pipeline, from buffer allocation through the refill loop to
//! segment assembly.

use thiserror::Error;

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Errors that can occur in the capture pipeline.
///
/// Allocation and configuration errors surface synchronously from the call
/// that caused them. Errors inside the running refill loop never cross the
/// thread boundary as panics; they are either tolerated
/// ([`TransientRefill`](Self::TransientRefill)) or reported through the
/// capture event channel as an [`Error`](crate::acquisition::CaptureEvent::Error)
/// event after an implicit stop.
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    /// The device-side capture buffer could not be created.
    ///
    /// Fatal to the current start attempt. Propagated to the caller,
    /// never retried.
    #[error("Failed to allocate capture buffer of {samples} samples: {message}")]
    Allocation { samples: u64, message: String },

    /// A single refill call failed.
    ///
    /// Tolerated: the acquisition loop treats it as a zero-byte packet and
    /// continues with the next refill.
    #[error("Transient refill failure: {message}")]
    TransientRefill { message: String },

    /// The device vanished mid-run.
    ///
    /// Triggers an implicit stop of the acquisition loop and a terminal
    /// error event to observers.
    #[error("Capture device unavailable: {message}")]
    DriverUnavailable { message: String },

    /// A segment append failed to grow its sample storage.
    ///
    /// The stream is stopped immediately. The partial segment is retained
    /// read-only up to the last successful append, never silently dropped.
    #[error("Out of memory appending to segment for channel group {group} after {appended_samples} samples")]
    OutOfMemory { group: usize, appended_samples: usize },

    /// Invalid configuration value.
    #[error("Invalid capture configuration: {message}")]
    InvalidConfig { message: String },
}

impl CaptureError {
    /// Check whether the acquisition loop may keep running after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRefill { .. })
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
