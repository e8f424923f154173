//! Error types for DAQ control.
//!
//! `DaqError` covers everything the run coordinator, the control endpoints and
//! the plan runner can report. Using `thiserror`, each variant carries enough
//! context to tell the operator what was refused and why.
//!
//! ## Error Categories
//!
//! - **State conflicts** (`InvalidTransition`, `StateConflict`): a request was
//!   made from a state that does not permit it. Never retried silently.
//! - **Validation** (`Validation`): malformed arguments, raised before any
//!   remote call is attempted.
//! - **Remote failures** (`Remote`): the endpoint's own connect or configure
//!   call failed. The coordinator resets its local view before returning it.
//! - **Waiting** (`Timeout`, `NotRunning`): blocking waits that exceeded their
//!   budget, or an end-of-run wait with nothing running.
//!
//! An "ignored" transition is not an error at all; see
//! [`TransitionOutcome`](crate::control::state::TransitionOutcome).

use std::time::Duration;

use thiserror::Error;

use crate::control::state::{ControllerState, Transition};

/// Convenience alias for results using the DAQ error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for DAQ control.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The endpoint state machine refused a transition.
    ///
    /// **Recovery Strategy**: bring the endpoint into a state listed as legal
    /// for the transition (for example `end_run` before `configure`).
    #[error("Invalid transition {transition} from state {state}")]
    InvalidTransition {
        /// Transition that was requested
        transition: Transition,
        /// State the endpoint was in
        state: ControllerState,
    },

    /// A coordinator operation is not allowed in the current logical state.
    #[error("Cannot {operation} while the DAQ is {state}")]
    StateConflict {
        /// Operation that was requested
        operation: &'static str,
        /// Logical state at the time of the request
        state: ControllerState,
    },

    /// Arguments failed validation. Nothing was sent to the endpoint.
    #[error("Invalid DAQ argument: {0}")]
    Validation(String),

    /// The remote endpoint failed a connect or configure call.
    ///
    /// The endpoint is assumed to be in an unknown but safe state; the
    /// coordinator has already dropped the endpoint (connect) or cleared its
    /// stored configuration (configure).
    #[error("DAQ {operation} failed: {message}")]
    Remote {
        /// Remote call that failed
        operation: &'static str,
        /// Failure reported by the endpoint
        message: String,
    },

    /// An operation needed a connection and none could be made.
    #[error("Could not connect to DAQ")]
    NotConnected,

    /// `end` was requested while nothing is running.
    #[error("DAQ is not running")]
    NotRunning,

    /// A plan-only helper was used outside of a wrapped plan.
    #[error("{0} is only valid inside a DAQ-wrapped plan")]
    OutsidePlan(&'static str),

    /// A blocking wait exceeded its budget.
    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: &'static str,
        /// Budget that elapsed
        timeout: Duration,
    },

    /// A plan failed while running under the run engine.
    #[error("Plan failed: {0}")]
    Plan(String),

    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),
}

impl DaqError {
    /// Wrap an endpoint failure as a remote failure of `operation`.
    pub fn remote(operation: &'static str, source: impl std::fmt::Display) -> Self {
        DaqError::Remote {
            operation,
            message: source.to_string(),
        }
    }

    /// True for failures that only mean "there is nothing to finish".
    pub fn is_benign_end(&self) -> bool {
        matches!(self, DaqError::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = DaqError::InvalidTransition {
            transition: Transition::Configure,
            state: ControllerState::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition configure from state Running"
        );
    }

    #[test]
    fn test_remote_wraps_display() {
        let err = DaqError::remote("connect", "partition not allocated");
        assert!(matches!(err, DaqError::Remote { operation: "connect", .. }));
        assert!(err.to_string().contains("partition not allocated"));
    }

    #[test]
    fn test_benign_end() {
        assert!(DaqError::NotRunning.is_benign_end());
        assert!(!DaqError::NotConnected.is_benign_end());
    }
}
