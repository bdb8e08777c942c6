//! Reelgen generation providers.
//!
//! Every provider implements [`ProviderAdapter`]: `generate` returns an
//! [`Asset`](reelgen_core::asset::Asset) or a typed [`ProviderError`] and
//! never retries on its own. Retry, circuit breaking and timeouts are the
//! pipeline's job.
//!
//! The closed set of configurable implementations is
//! [`ProviderKind`](reelgen_core::config::ProviderKind): [`HttpProvider`]
//! and [`FixtureProvider`]. [`ScriptedProvider`] is a programmable double
//! for tests and demos.

pub mod adapter;
pub mod error;
pub mod fixture;
pub mod http;
pub mod registry;
pub mod scripted;

pub use adapter::{ProviderAdapter, ProviderHandle};
pub use error::ProviderError;
pub use fixture::FixtureProvider;
pub use http::HttpProvider;
pub use registry::ProviderRegistry;
pub use scripted::{ScriptStep, ScriptedProvider};
