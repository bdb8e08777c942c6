//! Single-flight coordination for identical cache keys.
//!
//! The first request to claim a key becomes the leader and generates; every
//! later claimant follows and waits for the leader's published result. A
//! leader that goes away without publishing (panic, dropped future) closes
//! the channel and followers claim again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use reelgen_core::types::{ProviderId, Usd};
use tokio::sync::watch;

use crate::error::PipelineError;

/// What a leader hands to its followers.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightOutcome {
    /// Validated asset the follower copies into its own output slot.
    pub source: PathBuf,
    pub provider_id: ProviderId,
    pub checksum: String,
    /// What the leader paid; followers record it as saved.
    pub cost: Usd,
}

pub type FlightResult = Result<FlightOutcome, PipelineError>;

type Flights = Arc<Mutex<HashMap<String, watch::Sender<Option<FlightResult>>>>>;

fn lock(flights: &Flights) -> MutexGuard<'_, HashMap<String, watch::Sender<Option<FlightResult>>>> {
    flights.lock().unwrap_or_else(|p| p.into_inner())
}

/// Result of [`SingleFlight::claim`].
#[derive(Debug)]
pub enum Claim {
    Leader(FlightGuard),
    Follower(FlightWaiter),
}

/// In-flight generations keyed by cache digest.
#[derive(Debug, Default, Clone)]
pub struct SingleFlight {
    flights: Flights,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the leader for `digest`, or follow the current leader.
    pub fn claim(&self, digest: &str) -> Claim {
        let mut flights = lock(&self.flights);
        if let Some(sender) = flights.get(digest) {
            return Claim::Follower(FlightWaiter {
                receiver: sender.subscribe(),
            });
        }
        let (sender, _) = watch::channel(None);
        flights.insert(digest.to_string(), sender);
        Claim::Leader(FlightGuard {
            digest: digest.to_string(),
            flights: self.flights.clone(),
            done: false,
        })
    }

    /// Number of keys currently generating.
    pub fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }
}

/// Leadership of one key. Publish with [`FlightGuard::complete`]; dropping
/// it unpublished releases the key.
#[derive(Debug)]
pub struct FlightGuard {
    digest: String,
    flights: Flights,
    done: bool,
}

impl FlightGuard {
    pub fn complete(mut self, result: FlightResult) {
        self.done = true;
        if let Some(sender) = lock(&self.flights).remove(&self.digest) {
            sender.send_replace(Some(result));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.done {
            lock(&self.flights).remove(&self.digest);
        }
    }
}

/// A follower's handle on the leader's result.
#[derive(Debug)]
pub struct FlightWaiter {
    receiver: watch::Receiver<Option<FlightResult>>,
}

impl FlightWaiter {
    /// Wait for the leader. `None` means the leader vanished without a
    /// result and the caller should claim again.
    pub async fn wait(mut self) -> Option<FlightResult> {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        }
    }
}
