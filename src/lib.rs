//! ICE Gather Probe - measures how long candidate gathering takes.
//!
//! This crate runs ICE candidate gathering against a single STUN or TURN
//! server and reports every discovered candidate with its time offset from
//! the start of gathering, followed by the outcome (complete or timeout).
//!
//! # Usage
//!
//! ```bash
//! ice-gather-probe stun:stun.l.google.com:19302
//! ice-gather-probe --timeout 2 --output-format json turn:turn.example.org
//! ```

/// Drain barrier for in-flight candidate handlers.
pub mod barrier;
/// ICE candidate records and their JSON/SDP forms.
pub mod candidate;
/// Command-line configuration and validation.
pub mod configuration;
/// Discovery engine trait and the bundled gatherer.
pub mod engine;
/// Completion-vs-timeout gate.
pub mod gate;
/// STUN/TURN server URL parsing.
pub mod ice_url;
/// Report formatting.
pub mod output;
/// Probe orchestration.
pub mod probe;
/// Session state and clock.
pub mod session;
/// Engine-facing event handlers.
pub mod sink;
/// STUN Binding client.
pub mod stun;
