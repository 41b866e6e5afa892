//! Engine-facing event handlers.
//!
//! An [`EventSink`] is handed to the discovery engine, which may call it from
//! any number of its own tasks or threads. Handlers never block: each candidate
//! is timed, serialized and forwarded over an unbounded channel to the probe,
//! and the terminal state is forwarded through the single-slot completion
//! signal. Dropping the last clone of the sink closes the event channel, which
//! the probe reads as the engine's drain acknowledgment.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    barrier::DrainBarrier, candidate::Candidate, engine::GathererState, gate::CompletionSignal,
    session::SessionClock,
};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to serialize candidate: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// What a candidate event carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventPayload {
    /// A discovered candidate and its single-line JSON record.
    Candidate { candidate: Candidate, record: String },
    /// The engine reported that no more candidates will follow.
    EndOfCandidates,
}

/// One processed candidate notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateEvent {
    /// Time since the session start at which the handler ran.
    pub elapsed: Duration,
    pub payload: EventPayload,
}

impl CandidateEvent {
    pub fn candidate(&self) -> Option<&Candidate> {
        match &self.payload {
            EventPayload::Candidate { candidate, .. } => Some(candidate),
            EventPayload::EndOfCandidates => None,
        }
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.payload == EventPayload::EndOfCandidates
    }
}

/// Receiving end of the candidate event stream.
pub type EventStream = mpsc::UnboundedReceiver<CandidateEvent>;

struct SinkInner {
    clock: Arc<SessionClock>,
    barrier: Arc<DrainBarrier>,
    completion: CompletionSignal,
    events: mpsc::UnboundedSender<CandidateEvent>,
}

#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    /// Creates a sink and the stream its candidate events are delivered on.
    pub fn new(
        clock: Arc<SessionClock>,
        barrier: Arc<DrainBarrier>,
        completion: CompletionSignal,
    ) -> (EventSink, EventStream) {
        let (events, stream) = mpsc::unbounded_channel();
        let sink = EventSink {
            inner: Arc::new(SinkInner {
                clock,
                barrier,
                completion,
                events,
            }),
        };
        (sink, stream)
    }

    /// Handles a gatherer state change. Only `Complete` is acted on.
    pub fn on_state_change(&self, state: GathererState) {
        log::debug!("gatherer state: {}", state);
        if state == GathererState::Complete && !self.inner.completion.fire() {
            log::debug!("duplicate complete notification ignored");
        }
    }

    /// Handles one candidate notification; `None` marks the end of candidates.
    pub fn on_candidate(&self, candidate: Option<Candidate>) {
        self.process_candidate(candidate, serialize::<Candidate>);
    }

    /// A candidate whose record cannot be encoded is logged and dropped.
    fn process_candidate<F>(&self, candidate: Option<Candidate>, encode: F)
    where
        F: FnOnce(&Candidate) -> Result<String, SinkError>,
    {
        let _guard = self.inner.barrier.enter();
        let elapsed = self.inner.clock.elapsed();

        let payload = match candidate {
            None => EventPayload::EndOfCandidates,
            Some(candidate) => match encode(&candidate) {
                Ok(record) => EventPayload::Candidate { candidate, record },
                Err(e) => {
                    log::error!("{} ({})", e, candidate);
                    return;
                }
            },
        };

        if self
            .inner
            .events
            .send(CandidateEvent { elapsed, payload })
            .is_err()
        {
            log::debug!("candidate event after the probe stopped listening");
        }
    }
}

fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<String, SinkError> {
    Ok(serde_json::to_string(value)?)
}
