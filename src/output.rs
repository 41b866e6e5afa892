//! Report formatting.
//!
//! The text format is line-oriented and human readable; the JSON format emits
//! one object per line for machine consumption.

use std::{
    fmt,
    io::{self, Write},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    candidate::Candidate,
    probe::{ProbeOutcome, ProbeReport},
    sink::{CandidateEvent, EventPayload},
};

/// Output format for the probe report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON lines output.
    Json,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum JsonLine<'a> {
    Start {
        server: &'a str,
        started_at: String,
    },
    Candidate {
        elapsed: f64,
        candidate: &'a Candidate,
        sdp: String,
    },
    EndOfCandidates {
        elapsed: f64,
    },
    Complete {
        duration: f64,
        candidates: usize,
    },
    Timeout {
        duration: f64,
        candidates: usize,
    },
    Failed {
        reason: String,
    },
}

/// Writes probe progress to an output stream as it happens.
pub struct Reporter<W: Write> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Reporter { out, format }
    }

    /// Announces the start of gathering.
    pub fn start(&mut self, server: &str, started_at: DateTime<Utc>) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "gathering...")?,
            OutputFormat::Json => self.write_json(&JsonLine::Start {
                server,
                started_at: started_at.to_rfc3339(),
            })?,
        }
        self.out.flush()
    }

    /// Writes one candidate event. The end-of-candidates marker only appears in JSON output.
    pub fn event(&mut self, event: &CandidateEvent) -> io::Result<()> {
        let elapsed = event.elapsed.as_secs_f64();
        match (&event.payload, self.format) {
            (EventPayload::Candidate { record, .. }, OutputFormat::Text) => {
                writeln!(self.out, "time: {:.6}s", elapsed)?;
                writeln!(self.out, "{}", record)?;
            }
            (EventPayload::Candidate { candidate, .. }, OutputFormat::Json) => {
                self.write_json(&JsonLine::Candidate {
                    elapsed,
                    candidate,
                    sdp: candidate.to_string(),
                })?;
            }
            (EventPayload::EndOfCandidates, OutputFormat::Text) => {
                log::debug!("end of candidates after {:.6}s", elapsed);
                return Ok(());
            }
            (EventPayload::EndOfCandidates, OutputFormat::Json) => {
                self.write_json(&JsonLine::EndOfCandidates { elapsed })?;
            }
        }
        self.out.flush()
    }

    /// Writes the terminal line for the run.
    pub fn finish(&mut self, report: &ProbeReport) -> io::Result<()> {
        let duration = report.duration.as_secs_f64();
        let candidates = report.candidates().count();
        match self.format {
            OutputFormat::Text => {
                let line = match report.outcome {
                    ProbeOutcome::Complete => "gathering complete!",
                    ProbeOutcome::TimedOut => "timeout!",
                };
                writeln!(self.out, "{}", line)?;
            }
            OutputFormat::Json => {
                let line = match report.outcome {
                    ProbeOutcome::Complete => JsonLine::Complete {
                        duration,
                        candidates,
                    },
                    ProbeOutcome::TimedOut => JsonLine::Timeout {
                        duration,
                        candidates,
                    },
                };
                self.write_json(&line)?;
            }
        }
        self.out.flush()
    }

    /// Writes the terminal line for a run whose engine refused to start.
    pub fn failed(&mut self, reason: &dyn fmt::Display) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "gathering failed!")?,
            OutputFormat::Json => self.write_json(&JsonLine::Failed {
                reason: reason.to_string(),
            })?,
        }
        self.out.flush()
    }

    fn write_json(&mut self, line: &JsonLine) -> io::Result<()> {
        let json = serde_json::to_string(line)?;
        writeln!(self.out, "{}", json)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
