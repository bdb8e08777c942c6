//! In-process progress bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` between the orchestrator
//! (producer) and any number of consumers: the WebSocket stream, the event
//! journal and tests. Consumers that only care about one request or one
//! batch wrap their receiver in a [`FilteredReceiver`].

use chrono::Utc;
use reelgen_core::progress::Stage;
use reelgen_core::types::{BatchId, RequestId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// One state transition of one request.
///
/// Serialized in camelCase for external consumers. Delivery is
/// at-least-once; consumers deduplicate by `(jobId, stage)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// The request id.
    pub job_id: RequestId,
    pub batch_id: BatchId,
    pub scene_id: String,
    pub stage: Stage,
    pub percent: u8,
    pub message: String,
    pub timestamp: Timestamp,
}

impl ProgressEvent {
    /// Create an event at the stage's nominal percentage.
    pub fn new(
        job_id: RequestId,
        batch_id: BatchId,
        scene_id: impl Into<String>,
        stage: Stage,
    ) -> Self {
        Self {
            job_id,
            batch_id,
            scene_id: scene_id.into(),
            stage,
            percent: stage.percent(),
            message: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a human-readable message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 4096;

/// In-process fan-out bus for progress events.
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: ProgressEvent) {
        // A send error only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of one request.
    pub fn subscribe_job(&self, job_id: RequestId) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), EventFilter::Job(job_id))
    }

    /// Subscribe to the events of one batch.
    pub fn subscribe_batch(&self, batch_id: BatchId) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), EventFilter::Batch(batch_id))
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Filtered subscriptions
// ---------------------------------------------------------------------------

/// Which events a [`FilteredReceiver`] yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Job(RequestId),
    Batch(BatchId),
}

impl EventFilter {
    pub fn matches(&self, event: &ProgressEvent) -> bool {
        match self {
            EventFilter::Job(id) => event.job_id == *id,
            EventFilter::Batch(id) => event.batch_id == *id,
        }
    }
}

/// A broadcast receiver that skips events outside its filter.
pub struct FilteredReceiver {
    inner: broadcast::Receiver<ProgressEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(inner: broadcast::Receiver<ProgressEvent>, filter: EventFilter) -> Self {
        Self { inner, filter }
    }

    pub fn filter(&self) -> EventFilter {
        self.filter
    }

    /// Receive the next matching event. Lag is reported to the caller, who
    /// decides whether to continue.
    pub async fn recv(&mut self) -> Result<ProgressEvent, broadcast::error::RecvError> {
        loop {
            let event = self.inner.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
