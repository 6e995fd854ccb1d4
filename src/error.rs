//! Custom error types for the acquisition pipeline.
//!
//! This module defines the primary error type, [`DaqError`], for the whole
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle every failure the pipeline can raise, from unit
//! conversion faults to controller-level scheduling errors.
//!
//! ## Error taxonomy
//!
//! `DaqError` consolidates the semantic error kinds named throughout the
//! component specs:
//!
//! - **`UnknownConversion` / `MeasurementIncompatibility`** — unit registry
//!   faults; surfaced to the caller, never retried.
//! - **`SampleRateMismatch`** — a stream received a block at the wrong rate;
//!   terminates the current iteration with `ExceptionalStop`.
//! - **`ExistingConfiguration`** — an attempt to tag an already-tagged block.
//! - **`StreamConflict`** — a bit-position collision on a digital stream.
//! - **`ExternalDeviceError`** — invalid duration, missing parameters, or an
//!   illegal operating mode on an external device.
//! - **`StimulusError`** — unit drift from a delegated stimulus block.
//! - **`EpochValidation`** — inconsistent durations or an indefinite epoch
//!   carrying responses; rejected at enqueue time.
//! - **`DAQError`** — the hardware (or simulator) refused an operation.
//! - **`ControllerError`** — the trial queue was empty, a double-advance was
//!   attempted, or the persistence task faulted.
//!
//! By using `#[from]`, `DaqError` can be constructed from underlying error
//! types and propagated with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate's error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("no unit conversion registered from '{from}' to '{to}'")]
    UnknownConversion { from: String, to: String },

    #[error("measurement incompatibility: expected base unit '{expected}', got '{actual}'")]
    MeasurementIncompatibility { expected: String, actual: String },

    #[error("block sample rate {actual} Hz does not match stream sample rate {expected} Hz")]
    SampleRateMismatch { expected: f64, actual: f64 },

    #[error("pipeline node '{0}' is already present in this configuration span")]
    ExistingConfiguration(String),

    #[error("bit position {position} on stream '{stream}' is already claimed by another device")]
    StreamConflict { stream: String, position: u8 },

    #[error("external device error: {0}")]
    ExternalDeviceError(String),

    #[error("stimulus error: {0}")]
    StimulusError(String),

    #[error("epoch validation failed: {0}")]
    EpochValidation(String),

    #[error("DAQ controller error: {0}")]
    DAQError(String),

    #[error("controller error: {0}")]
    ControllerError(String),

    #[error("argument error: {0}")]
    ArgumentError(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("persistence failed: {0}")]
    PersistenceError(String),

    #[error("{} errors occurred while shutting down", .0.len())]
    ShutdownFailed(Vec<DaqError>),

    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl DaqError {
    /// Aggregate a batch of errors raised while tearing down a controller or
    /// joining persistence tasks into a single error, following the
    /// `ShutdownFailed` convention used for best-effort teardown.
    pub fn aggregate(errors: Vec<DaqError>) -> DaqError {
        if errors.len() == 1 {
            errors.into_iter().next().expect("len checked above")
        } else {
            DaqError::ShutdownFailed(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_single_error_passes_through() {
        let err = DaqError::aggregate(vec![DaqError::ControllerError("boom".into())]);
        match err {
            DaqError::ControllerError(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn aggregate_multiple_errors_wraps() {
        let err = DaqError::aggregate(vec![
            DaqError::ControllerError("a".into()),
            DaqError::PersistenceError("b".into()),
        ]);
        match err {
            DaqError::ShutdownFailed(errs) => assert_eq!(errs.len(), 2),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn sample_rate_mismatch_message() {
        let err = DaqError::SampleRateMismatch {
            expected: 1000.0,
            actual: 2000.0,
        };
        assert!(err.to_string().contains("1000"));
        assert!(err.to_string().contains("2000"));
    }
}
