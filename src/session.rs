use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use thiserror::Error;

/// Lifecycle of a gathering session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Gathering,
    Complete,
    TimedOut,
    /// The engine refused to start.
    Failed,
}

impl SessionState {
    /// Returns true once the session reached Complete, TimedOut or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Complete | SessionState::TimedOut | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Gathering => write!(f, "gathering"),
            SessionState::Complete => write!(f, "complete"),
            SessionState::TimedOut => write!(f, "timed out"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// Write-once start time shared between the probe and the candidate handlers.
#[derive(Debug, Default)]
pub struct SessionClock {
    start: OnceLock<Instant>,
}

impl SessionClock {
    pub fn new() -> Self {
        SessionClock {
            start: OnceLock::new(),
        }
    }

    /// Records the start time. Only the first call has an effect.
    pub fn start(&self) -> Instant {
        *self.start.get_or_init(Instant::now)
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.start.get().copied()
    }

    /// Time elapsed since the start, zero if the clock was never started.
    pub fn elapsed(&self) -> Duration {
        self.start
            .get()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }
}

/// State of one probe run against one server.
pub struct GatherSession {
    server_endpoint: String,
    state: SessionState,
    clock: Arc<SessionClock>,
}

impl GatherSession {
    pub fn new(server_endpoint: impl Into<String>) -> GatherSession {
        GatherSession {
            server_endpoint: server_endpoint.into(),
            state: SessionState::Idle,
            clock: Arc::new(SessionClock::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Shared handle to the session clock, for event handlers.
    pub fn clock(&self) -> Arc<SessionClock> {
        self.clock.clone()
    }

    /// Idle -> Gathering. Starts the session clock.
    pub fn begin(&mut self) -> Result<Instant, SessionError> {
        self.transition(SessionState::Gathering)?;
        Ok(self.clock.start())
    }

    /// Gathering -> Complete, TimedOut or Failed.
    pub fn finish(&mut self, to: SessionState) -> Result<(), SessionError> {
        if !to.is_terminal() {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.transition(to)
    }

    fn transition(&mut self, to: SessionState) -> Result<(), SessionError> {
        let allowed = matches!(
            (self.state, to),
            (SessionState::Idle, SessionState::Gathering)
                | (SessionState::Gathering, SessionState::Complete)
                | (SessionState::Gathering, SessionState::TimedOut)
                | (SessionState::Gathering, SessionState::Failed)
        );
        if !allowed {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        log::debug!("session {}: {} -> {}", self.server_endpoint, self.state, to);
        self.state = to;
        Ok(())
    }
}
