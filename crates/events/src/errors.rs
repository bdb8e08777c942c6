//! Error context logger.
//!
//! Every failure path writes one [`ErrorRecord`] whose `correlation_id` is
//! the originating request id. Messages pass through
//! [`redact`](reelgen_core::redaction::redact) before they are stored or
//! logged, so no raw provider message ever reaches a sink.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use reelgen_core::redaction::redact;
use reelgen_core::types::{BatchId, RequestId, Timestamp};
use serde::Serialize;
use uuid::Uuid;

/// Records retained in memory; the oldest are dropped beyond this.
pub const MAX_ERROR_RECORDS: usize = 10_000;

/// Error taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Timeout,
    RateLimited,
    AuthFailure,
    ContentRejected,
    CircuitOpen,
    CorruptionUnrecoverable,
    ServiceUnavailable,
    Storage,
    Cancelled,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::AuthFailure => "auth_failure",
            ErrorCategory::ContentRejected => "content_rejected",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::CorruptionUnrecoverable => "corruption_unrecoverable",
            ErrorCategory::ServiceUnavailable => "service_unavailable",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Internal => "internal",
        }
    }
}

/// One recorded failure. Append-only apart from the `recovered` flag.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub correlation_id: RequestId,
    pub request_id: RequestId,
    pub batch_id: Option<BatchId>,
    pub category: ErrorCategory,
    /// Component that observed the failure (`adapter`, `cache`,
    /// `detector`, `breaker`, `orchestrator`, `storage`).
    pub component: &'static str,
    /// Redacted message.
    pub message: String,
    pub timestamp: Timestamp,
    pub recovered: bool,
}

/// Append-only store of [`ErrorRecord`]s.
#[derive(Default)]
pub struct ErrorLog {
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. The message is redacted before it is stored or
    /// mirrored to the log. Returns the new record's id.
    pub fn record(
        &self,
        request_id: RequestId,
        batch_id: Option<BatchId>,
        category: ErrorCategory,
        component: &'static str,
        message: &str,
    ) -> Uuid {
        let record = ErrorRecord {
            id: Uuid::now_v7(),
            correlation_id: request_id,
            request_id,
            batch_id,
            category,
            component,
            message: redact(message),
            timestamp: Utc::now(),
            recovered: false,
        };
        tracing::warn!(
            correlation_id = %record.correlation_id,
            category = record.category.as_str(),
            component = record.component,
            message = %record.message,
            "Generation error recorded"
        );
        let id = record.id;
        let mut records = self.lock();
        if records.len() == MAX_ERROR_RECORDS {
            records.pop_front();
        }
        records.push_back(record);
        id
    }

    /// Flag every unrecovered record of `correlation_id` as recovered.
    /// Returns how many records changed.
    pub fn mark_recovered(&self, correlation_id: RequestId) -> usize {
        let mut records = self.lock();
        let mut changed = 0;
        for record in records
            .iter_mut()
            .filter(|r| r.correlation_id == correlation_id && !r.recovered)
        {
            record.recovered = true;
            changed += 1;
        }
        if changed > 0 {
            tracing::debug!(%correlation_id, changed, "Error records marked recovered");
        }
        changed
    }

    /// Records of one request, oldest first.
    pub fn records_for(&self, correlation_id: RequestId) -> Vec<ErrorRecord> {
        self.lock()
            .iter()
            .filter(|r| r.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// Records of one batch, oldest first.
    pub fn records_for_batch(&self, batch_id: BatchId) -> Vec<ErrorRecord> {
        self.lock()
            .iter()
            .filter(|r| r.batch_id == Some(batch_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ErrorRecord>> {
        // Records stay consistent even if a writer panicked mid-push.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_redacted_on_record() {
        let log = ErrorLog::new();
        let request = Uuid::now_v7();
        log.record(
            request,
            None,
            ErrorCategory::AuthFailure,
            "adapter",
            "401 from https://api.example.com?api_key=supersecret123",
        );
        let records = log.records_for(request);
        assert_eq!(records.len(), 1);
        assert!(!records[0].message.contains("supersecret123"));
        assert_eq!(records[0].correlation_id, request);
    }

    #[test]
    fn records_are_correlated_per_request() {
        let log = ErrorLog::new();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        log.record(a, None, ErrorCategory::Transient, "adapter", "503");
        log.record(b, None, ErrorCategory::Timeout, "adapter", "timed out");
        log.record(a, None, ErrorCategory::Transient, "adapter", "502");
        assert_eq!(log.records_for(a).len(), 2);
        assert_eq!(log.records_for(b).len(), 1);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn mark_recovered_only_touches_one_request() {
        let log = ErrorLog::new();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        log.record(a, None, ErrorCategory::Transient, "adapter", "503");
        log.record(a, None, ErrorCategory::Transient, "adapter", "503");
        log.record(b, None, ErrorCategory::Transient, "adapter", "503");

        assert_eq!(log.mark_recovered(a), 2);
        assert_eq!(log.mark_recovered(a), 0);
        assert!(log.records_for(a).iter().all(|r| r.recovered));
        assert!(!log.records_for(b)[0].recovered);
    }

    #[test]
    fn oldest_records_are_dropped_at_capacity() {
        let log = ErrorLog::new();
        let first = Uuid::now_v7();
        log.record(first, None, ErrorCategory::Transient, "adapter", "first");
        let rest = Uuid::now_v7();
        for _ in 0..MAX_ERROR_RECORDS {
            log.record(rest, None, ErrorCategory::Transient, "adapter", "later");
        }

        assert_eq!(log.len(), MAX_ERROR_RECORDS);
        assert!(log.records_for(first).is_empty());

        let newest = Uuid::now_v7();
        log.record(newest, None, ErrorCategory::Timeout, "adapter", "newest");
        assert_eq!(log.len(), MAX_ERROR_RECORDS);
        assert_eq!(log.records_for(newest).len(), 1);
        assert_eq!(log.records_for(rest).len(), MAX_ERROR_RECORDS - 1);
    }

    #[test]
    fn batch_filter() {
        let log = ErrorLog::new();
        let batch = Uuid::now_v7();
        log.record(Uuid::now_v7(), Some(batch), ErrorCategory::CircuitOpen, "breaker", "open");
        log.record(Uuid::now_v7(), None, ErrorCategory::CircuitOpen, "breaker", "open");
        assert_eq!(log.records_for_batch(batch).len(), 1);
    }
}
