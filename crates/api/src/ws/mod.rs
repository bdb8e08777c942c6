//! Progress WebSocket.

pub mod events;

pub use events::batch_events_handler;
