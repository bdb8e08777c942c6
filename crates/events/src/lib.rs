//! Reelgen progress events and error context.
//!
//! - [`EventBus`]: in-process publish/subscribe hub for [`ProgressEvent`]s,
//!   backed by `tokio::sync::broadcast`, with per-job and per-batch
//!   subscriptions.
//! - [`ErrorLog`]: append-only, redacted error records correlated by
//!   request id.
//! - [`EventJournal`]: background task appending every event to a
//!   JSON-lines file.

pub mod bus;
pub mod errors;
pub mod journal;

pub use bus::{EventBus, EventFilter, FilteredReceiver, ProgressEvent};
pub use errors::{ErrorCategory, ErrorLog, ErrorRecord};
pub use journal::EventJournal;
