//! Gathering-time probe.
//!
//! [`TimingProbe::run`] builds an engine, starts the session clock, starts
//! gathering and then races the completion gate against the timeout while
//! forwarding candidate events to the [`Reporter`] as they arrive.
//!
//! On completion the probe waits for the engine to release its event sink
//! (bounded by the drain grace window) and then for the drain barrier to reach
//! zero, so every candidate whose handler started is in the report. The barrier
//! wait is capped by whatever is left of the timeout, and never less than the
//! grace window. On timeout the engine is closed and the report holds whatever
//! was delivered so far.

use std::{fmt, io, io::Write, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    barrier::DrainBarrier,
    candidate::Candidate,
    engine::{DiscoveryEngine, EngineError},
    gate::{CompletionGate, GateOutcome},
    output::Reporter,
    session::{GatherSession, SessionError, SessionState},
    sink::{CandidateEvent, EventSink, EventStream},
};

/// Default time to wait for gathering to complete.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on waiting for the engine's drain acknowledgment.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Gatherer initialization failed: {0}")]
    GathererInitFailed(#[source] EngineError),
    #[error("Gatherer failed to start: {0}")]
    StartFailed(#[source] EngineError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Terminal outcome of a probe run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Complete,
    TimedOut,
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProbeOutcome::Complete => write!(f, "complete"),
            ProbeOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Everything a probe run observed.
#[derive(Debug)]
pub struct ProbeReport {
    pub server_endpoint: String,
    /// Wall-clock time at which gathering started.
    pub started_at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
    /// Candidate events in the order they were received, sentinel included.
    pub events: Vec<CandidateEvent>,
    /// Session duration at the time the outcome was decided.
    pub duration: Duration,
    /// Candidate handlers still running when the report was built.
    pub in_flight: usize,
}

impl ProbeReport {
    /// Discovered candidates, without the end-of-candidates sentinel.
    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.events.iter().filter_map(CandidateEvent::candidate)
    }

    /// Whether the engine reported the end of candidates before the outcome.
    pub fn saw_end_of_candidates(&self) -> bool {
        self.events.iter().any(CandidateEvent::is_end_of_candidates)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub drain_grace: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            timeout: DEFAULT_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

pub struct TimingProbe {
    server_endpoint: String,
    settings: ProbeSettings,
}

impl TimingProbe {
    pub fn new(server_endpoint: impl Into<String>, settings: ProbeSettings) -> Self {
        TimingProbe {
            server_endpoint: server_endpoint.into(),
            settings,
        }
    }

    /// Runs one gathering session.
    ///
    /// `build` constructs the engine for the configured endpoint; its failure
    /// is reported as [`ProbeError::GathererInitFailed`] before anything is
    /// written or timed. If the engine then refuses to start, the reporter
    /// writes its failure line and [`ProbeError::StartFailed`] is returned.
    /// The engine is always closed before this returns.
    pub async fn run<E, F, W>(
        &self,
        build: F,
        reporter: &mut Reporter<W>,
    ) -> Result<ProbeReport, ProbeError>
    where
        E: DiscoveryEngine,
        F: FnOnce(&str) -> Result<E, EngineError>,
        W: Write,
    {
        let mut engine = build(&self.server_endpoint).map_err(ProbeError::GathererInitFailed)?;

        let mut session = GatherSession::new(self.server_endpoint.as_str());
        let barrier = Arc::new(DrainBarrier::new());
        let (signal, mut gate) = CompletionGate::channel();
        let (sink, mut stream) = EventSink::new(session.clock(), barrier.clone(), signal);

        let started_at = Utc::now();
        log_io(reporter.start(&self.server_endpoint, started_at));

        session.begin()?;
        if let Err(e) = engine.start_gathering(sink) {
            engine.close();
            session.finish(SessionState::Failed)?;
            log::error!("gathering against {} did not start: {}", self.server_endpoint, e);
            log_io(reporter.failed(&e));
            return Err(ProbeError::StartFailed(e));
        }
        log::info!("gathering started against {}", self.server_endpoint);

        let mut events = Vec::new();
        let mut stream_open = true;
        let gate_outcome = {
            let wait = gate.wait(self.settings.timeout);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    outcome = &mut wait => break outcome,
                    event = stream.recv(), if stream_open => match event {
                        Some(event) => deliver(event, &mut events, reporter),
                        None => stream_open = false,
                    },
                }
            }
        };

        let (state, outcome) = match gate_outcome {
            GateOutcome::TimedOut => {
                log::warn!(
                    "no completion from {} within {:?}",
                    self.server_endpoint,
                    self.settings.timeout
                );
                engine.close();
                gate.close();
                drain_ready(&mut stream, &mut events, reporter);
                (SessionState::TimedOut, ProbeOutcome::TimedOut)
            }
            GateOutcome::Completed => {
                if stream_open {
                    self.await_drain_ack(&mut stream, &mut events, reporter)
                        .await;
                }
                let limit = self
                    .settings
                    .timeout
                    .saturating_sub(session.clock().elapsed())
                    .max(self.settings.drain_grace);
                if !await_handlers(&barrier, limit).await {
                    log::warn!(
                        "{} candidate handlers still running {:?} after completion",
                        barrier.in_flight(),
                        limit
                    );
                }
                drain_ready(&mut stream, &mut events, reporter);
                engine.close();
                (SessionState::Complete, ProbeOutcome::Complete)
            }
        };

        let duration = session.clock().elapsed();
        session.finish(state)?;

        let report = ProbeReport {
            server_endpoint: self.server_endpoint.clone(),
            started_at,
            outcome,
            events,
            duration,
            in_flight: barrier.in_flight(),
        };
        log::info!(
            "gathering {} after {:.6}s with {} candidates",
            report.outcome,
            duration.as_secs_f64(),
            report.candidates().count()
        );
        log_io(reporter.finish(&report));
        Ok(report)
    }

    /// Forwards events until the engine releases the sink or the grace window ends.
    async fn await_drain_ack<W: Write>(
        &self,
        stream: &mut EventStream,
        events: &mut Vec<CandidateEvent>,
        reporter: &mut Reporter<W>,
    ) {
        let drained = tokio::time::timeout(self.settings.drain_grace, async move {
            while let Some(event) = stream.recv().await {
                deliver(event, events, reporter);
            }
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "engine still holds its event sink {:?} after completion",
                self.settings.drain_grace
            );
        }
    }
}

/// Waits for in-flight handlers to finish. Returns false if `limit` ran out first.
async fn await_handlers(barrier: &DrainBarrier, limit: Duration) -> bool {
    tokio::time::timeout(limit, barrier.wait_until_zero())
        .await
        .is_ok()
}

fn deliver<W: Write>(
    event: CandidateEvent,
    events: &mut Vec<CandidateEvent>,
    reporter: &mut Reporter<W>,
) {
    log_io(reporter.event(&event));
    events.push(event);
}

/// Forwards the events already queued, without waiting for more.
fn drain_ready<W: Write>(
    stream: &mut EventStream,
    events: &mut Vec<CandidateEvent>,
    reporter: &mut Reporter<W>,
) {
    while let Ok(event) = stream.try_recv() {
        deliver(event, events, reporter);
    }
}

fn log_io(result: io::Result<()>) {
    if let Err(e) = result {
        log::error!("cannot write report: {}", e);
    }
}
