//! Reelgen domain logic.
//!
//! Pure, synchronous building blocks of the generation core. Nothing here
//! performs I/O apart from [`config::EngineConfig::load`]; time is always
//! passed in so state machines can be driven by a paused clock in tests.
//!
//! - [`backoff`]: exponential backoff with jitter as an explicit state object.
//! - [`breaker`]: per-provider circuit breaker computed from attempt history.
//! - [`cache_key`] / [`fingerprint`]: exact content keys and MinHash prompt
//!   fingerprints for near-duplicate lookups.
//! - [`integrity`]: checksums, container validation and recovery.
//! - [`degradation`]: levels, thresholds, effect table and state machine.
//! - [`redaction`]: credential scrubbing for error messages.

pub mod asset;
pub mod backoff;
pub mod breaker;
pub mod cache_key;
pub mod config;
pub mod degradation;
pub mod error;
pub mod fingerprint;
pub mod hashing;
pub mod integrity;
pub mod media;
pub mod progress;
pub mod redaction;
pub mod request;
pub mod types;
