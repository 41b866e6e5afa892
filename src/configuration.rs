use std::time::Duration;

pub use clap::Parser;
use thiserror::Error;

use crate::{
    engine::GatherOptions,
    output::OutputFormat,
    probe::ProbeSettings,
    stun::StunPolicy,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Timeout must be greater than zero")]
    ZeroTimeout,
    #[error("Drain grace window ({grace_ms} ms) must be shorter than the timeout ({timeout_s} s)")]
    GraceTooLong { grace_ms: u64, timeout_s: u64 },
    #[error("STUN request timeout must be greater than zero")]
    ZeroStunTimeout,
}

#[derive(Parser, Debug)]
#[command(author = "Piotr Olszewski", version, about, long_about = None)]
pub struct Configuration {
    /// STUN or TURN server URL, e.g. stun:stun.l.google.com:19302
    pub server_url: String,
    /// Seconds to wait for gathering to complete
    #[arg(short, long, default_value_t = 5)]
    pub timeout: u64,
    /// Milliseconds to wait for the gatherer to release its event sink after completion
    #[arg(short = 'g', long, default_value_t = 100)]
    pub drain_grace: u64,
    /// Report format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
    /// Milliseconds to wait for each STUN response before retransmitting
    #[arg(long, default_value_t = 500)]
    pub stun_timeout: u64,
    /// STUN retransmissions after the first request
    #[arg(long, default_value_t = 2)]
    pub stun_retries: u32,
    /// Gather IPv6 host candidates too
    #[arg(long)]
    pub ipv6: bool,
    /// Exit with status 2 when gathering times out
    #[arg(long)]
    pub fail_on_timeout: bool,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.timeout == 0 {
            return Err(ConfigurationError::ZeroTimeout);
        }
        if self.drain_grace >= self.timeout.saturating_mul(1000) {
            return Err(ConfigurationError::GraceTooLong {
                grace_ms: self.drain_grace,
                timeout_s: self.timeout,
            });
        }
        if self.stun_timeout == 0 {
            return Err(ConfigurationError::ZeroStunTimeout);
        }
        Ok(())
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            timeout: Duration::from_secs(self.timeout),
            drain_grace: Duration::from_millis(self.drain_grace),
        }
    }

    pub fn gather_options(&self) -> GatherOptions {
        GatherOptions {
            stun: StunPolicy {
                timeout: Duration::from_millis(self.stun_timeout),
                retries: self.stun_retries,
            },
            include_ipv6: self.ipv6,
        }
    }
}
