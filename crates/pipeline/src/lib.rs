//! Reelgen generation pipeline.
//!
//! The async half of the engine: everything that owns state, touches the
//! filesystem or talks to providers.
//!
//! - [`service::BatchService`]: submit, track and cancel batches.
//! - [`orchestrator::Orchestrator`]: per-request flow from cache lookup to
//!   delivery, scheduled in waves sized by the degradation level.
//! - [`retry::ResilientCaller`] and [`breakers::BreakerRegistry`]: retry with
//!   backoff behind per-provider circuit breakers.
//! - [`cache::ContentCache`] and [`flight::SingleFlight`]: exact and
//!   similarity reuse, plus deduplication of identical in-flight requests.
//! - [`detector::CorruptionDetector`]: validation, recovery, quarantine.
//! - [`degradation::DegradationController`] and [`sampler::MetricsSampler`]:
//!   the process-wide degradation level and the samples that drive it.

pub mod breakers;
pub mod cache;
pub mod degradation;
pub mod detector;
pub mod error;
pub mod flight;
pub mod orchestrator;
pub mod outcome;
pub mod retry;
pub mod sampler;
pub mod service;
pub mod storage;

pub use error::PipelineError;
pub use orchestrator::{BatchContext, Orchestrator};
pub use outcome::{
    AssetSource, BatchState, BatchStatus, BatchSummary, DeliveredAsset, RequestOutcome,
};
pub use service::BatchService;
