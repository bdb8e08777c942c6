//! Request lifecycle stages reported on the progress stream.
//!
//! Consumers must tolerate duplicate `(job_id, stage)` pairs: delivery is
//! at-least-once.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One state transition of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    CacheLookup,
    CacheHit,
    /// Waiting on an identical in-flight generation.
    AwaitingDuplicate,
    Generating,
    Retrying,
    Validating,
    Persisting,
    Completed,
    Failed,
    Quarantined,
    Cancelled,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::CacheLookup => "cache_lookup",
            Stage::CacheHit => "cache_hit",
            Stage::AwaitingDuplicate => "awaiting_duplicate",
            Stage::Generating => "generating",
            Stage::Retrying => "retrying",
            Stage::Validating => "validating",
            Stage::Persisting => "persisting",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Quarantined => "quarantined",
            Stage::Cancelled => "cancelled",
        }
    }

    /// Nominal completion percentage for the stage.
    pub fn percent(self) -> u8 {
        match self {
            Stage::Queued => 0,
            Stage::CacheLookup => 5,
            Stage::CacheHit | Stage::AwaitingDuplicate => 50,
            Stage::Generating => 20,
            Stage::Retrying => 20,
            Stage::Validating => 80,
            Stage::Persisting => 90,
            Stage::Completed | Stage::Failed | Stage::Quarantined | Stage::Cancelled => 100,
        }
    }

    /// Terminal stages are always emitted, even when detailed progress is
    /// disabled by degradation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Stage::Completed | Stage::Failed | Stage::Quarantined | Stage::Cancelled
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_stages_are_complete() {
        for stage in [Stage::Completed, Stage::Failed, Stage::Quarantined, Stage::Cancelled] {
            assert!(stage.is_terminal());
            assert_eq!(stage.percent(), 100);
        }
        assert!(!Stage::Retrying.is_terminal());
    }

    #[test]
    fn serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Stage::CacheLookup).unwrap(),
            "\"cache_lookup\""
        );
    }
}
