//! Worker claims on jobs and the tokens that prove them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proof of holding a claim. Only the holder can finish the job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker's reservation of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub token: ClaimToken,
    pub worker: String,
    pub claimed_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(worker: impl Into<String>, claimed_at: DateTime<Utc>) -> Self {
        Self {
            token: ClaimToken::new(),
            worker: worker.into(),
            claimed_at,
        }
    }

    /// A claim held longer than `stale_after` is presumed abandoned (worker crash).
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now - self.claimed_at >= stale_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_uses_threshold() {
        let t0 = Utc::now();
        let claim = Claim::new("w1", t0);

        assert!(!claim.is_stale(t0 + Duration::seconds(59), Duration::seconds(60)));
        assert!(claim.is_stale(t0 + Duration::seconds(60), Duration::seconds(60)));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(ClaimToken::new(), ClaimToken::new());
    }
}
