use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad category of a capability failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityErrorKind {
    /// The request was rejected before the capability ran (bad input).
    InvalidInput,
    /// The capability could not be reached (network, auth, outage).
    Unavailable,
    /// The capability ran and refused (quota, policy, upstream error).
    Rejected,
    /// The capability answered with something that does not fit the contract.
    InvalidResponse,
    Internal,
}

/// Failure reported by a capability port.
///
/// Displays as the bare message: when a critical stage fails, this text is
/// what ends up in the job's `error` field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CapabilityError {
    pub kind: CapabilityErrorKind,
    pub message: String,
}

impl CapabilityError {
    pub fn new(kind: CapabilityErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::InvalidInput, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Unavailable, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Rejected, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::InvalidResponse, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Internal, message)
    }
}
