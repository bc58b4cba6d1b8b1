//! Error types for the acquisition pipeline.
//!
//! `AcqError` is the single error type returned by the library. It is built
//! with `thiserror` and falls into three groups:
//!
//! 1. **Caller errors** - `CapacityExceeded`, `NotAllocated`, `InvalidState`,
//!    `Configuration`, `Busy`. Returned synchronously and never retried by the
//!    pipeline itself.
//! 2. **Device errors** - `Driver`, `Health`, `NotHealthy`, `Trailer`. A
//!    driver error whose condition is a timeout is absorbed by the scheduler;
//!    everything else unwinds the running session.
//! 3. **Environment errors** - `Config` (figment), `Io`.
//!
//! `AcqError::is_fatal()` tells the scheduler which errors end a run.

use thiserror::Error;

use crate::buffer::BufferId;
use crate::driver::DriverError;
use crate::session::SessionState;

/// Convenience alias for results using the pipeline error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Primary error type for the acquisition pipeline.
#[derive(Error, Debug)]
pub enum AcqError {
    /// A wait on the driver or on the scheduler ran past its deadline.
    #[error("Operation timed out")]
    Timeout,

    /// The transfer driver or camera device reported a failure.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The device reported one or more fatal health conditions while running.
    #[error("Camera health error: {}", errors.join(", "))]
    Health {
        /// Names of the active error conditions.
        errors: Vec<String>,
    },

    /// The pool would exceed its hard buffer limit.
    #[error("Buffer pool capacity exceeded: requested {requested}, {available} slots available")]
    CapacityExceeded {
        /// Number of buffers requested.
        requested: usize,
        /// Free slots left in the pool.
        available: usize,
    },

    /// The buffer id is unknown to the pool or not in the `Allocated` state.
    #[error("Buffer {0} is not allocated")]
    NotAllocated(BufferId),

    /// The operation is not legal in the current session state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// Session state at the time of the call.
        state: SessionState,
    },

    /// `arm()` found active error conditions on the device.
    #[error("Camera is not healthy: {}", errors.join(", "))]
    NotHealthy {
        /// Names of the active error conditions.
        errors: Vec<String>,
    },

    /// The pipeline lock stayed contended for all retries.
    #[error("Pipeline is busy, lock not acquired after retries")]
    Busy,

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds an invalid value.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// File or stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A region did not carry a readable frame trailer.
    #[error("Frame trailer error: {0}")]
    Trailer(String),
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        AcqError::Config(Box::new(err))
    }
}

impl AcqError {
    /// Whether this error ends a running session.
    ///
    /// Driver timeouts are not fatal; they only feed the stall counter.
    pub fn is_fatal(&self) -> bool {
        match self {
            AcqError::Driver(err) => !err.is_timeout(),
            AcqError::Timeout => false,
            AcqError::Health { .. } | AcqError::Trailer(_) => true,
            _ => false,
        }
    }

    /// Whether this error was caused by caller input rather than the device.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            AcqError::CapacityExceeded { .. }
                | AcqError::NotAllocated(_)
                | AcqError::InvalidState { .. }
                | AcqError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::codes;

    #[test]
    fn timeout_driver_error_is_not_fatal() {
        let err = AcqError::from(DriverError::new(codes::TIMEOUT));
        assert!(!err.is_fatal());
        assert!(AcqError::from(DriverError::new(codes::TRANSFER_FAILED)).is_fatal());
    }

    #[test]
    fn health_error_lists_conditions() {
        let err = AcqError::Health {
            errors: vec!["sensor_temperature".into(), "camera_ram".into()],
        };
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Camera health error: sensor_temperature, camera_ram"
        );
    }

    #[test]
    fn caller_errors_are_classified() {
        let err = AcqError::CapacityExceeded {
            requested: 4,
            available: 2,
        };
        assert!(err.is_caller_error());
        assert!(!err.is_fatal());
        assert!(!AcqError::Busy.is_caller_error());
    }

    #[test]
    fn invalid_state_message_names_operation() {
        let err = AcqError::InvalidState {
            operation: "allocate buffers",
            state: SessionState::Running,
        };
        assert_eq!(err.to_string(), "Cannot allocate buffers while session is running");
    }
}
