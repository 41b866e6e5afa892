//! Candidate discovery engines.
//!
//! The probe drives any [`DiscoveryEngine`]; [`gatherer::IceGatherer`] is the
//! bundled implementation used by the binary.
//!
//! Ordering contract for implementations: every candidate notification,
//! including the end-of-candidates sentinel (`on_candidate(None)`), is
//! delivered before `GathererState::Complete`, and all clones of the sink are
//! released once gathering is over.

pub mod gatherer;

use std::fmt;

use thiserror::Error;

use crate::{ice_url::IceUrlError, sink::EventSink};

pub use gatherer::{GatherOptions, IceGatherer};

/// Gatherer states reported through [`EventSink::on_state_change`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GathererState {
    New,
    Gathering,
    Complete,
    Closed,
}

impl fmt::Display for GathererState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GathererState::New => write!(f, "new"),
            GathererState::Gathering => write!(f, "gathering"),
            GathererState::Complete => write!(f, "complete"),
            GathererState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid ICE server URL: {0}")]
    InvalidUrl(#[from] IceUrlError),
    #[error("Gathering already started")]
    AlreadyStarted,
    #[error("Gatherer is closed")]
    Closed,
    #[error("No async runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// A source of candidate events.
pub trait DiscoveryEngine: Send {
    /// Starts gathering in the background and returns immediately.
    ///
    /// Events are delivered to `sink` from the engine's own tasks.
    fn start_gathering(&mut self, sink: EventSink) -> Result<(), EngineError>;

    /// Stops any background work and releases the sink. Idempotent.
    fn close(&mut self);
}
