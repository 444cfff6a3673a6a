//! State machine errors.

use thiserror::Error;

use crate::JobState;

/// Why an event could not be applied. The job is left untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsmError {
    #[error("event '{event}' is not valid in state {state}")]
    InvalidTransition { event: String, state: JobState },

    #[error("malformed '{event}' event: {reason}")]
    Malformed { event: String, reason: String },

    #[error("'{event}' event would exhaust {what}")]
    ResourceExhausted { event: String, what: &'static str },
}

impl FsmError {
    pub(crate) fn invalid(event: &str, state: JobState) -> Self {
        FsmError::InvalidTransition {
            event: event.to_string(),
            state,
        }
    }

    pub(crate) fn malformed(event: &str, reason: impl Into<String>) -> Self {
        FsmError::Malformed {
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}
