use thiserror::Error;

/// A state transition that the lifecycle does not allow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: &'static str, to: &'static str },

    /// The job is not held by any worker.
    #[error("job is not claimed")]
    NotClaimed,

    /// The job is held by a different claim (it was reclaimed after going stale).
    #[error("claim token does not match the active claim")]
    ClaimMismatch,

    /// Stored data does not describe a valid state.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl TransitionError {
    pub fn illegal(from: &'static str, to: &'static str) -> Self {
        Self::IllegalTransition { from, to }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
