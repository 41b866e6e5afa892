use std::{fmt, str::FromStr};

use thiserror::Error;

/// Default port for `stun:` and `turn:` URLs (RFC 7064 / RFC 7065).
pub const DEFAULT_PORT: u16 = 3478;
/// Default port for the TLS variants `stuns:` and `turns:`.
pub const DEFAULT_TLS_PORT: u16 = 5349;

/// URL scheme of an ICE server.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl Scheme {
    /// Returns true for the TURN schemes.
    pub fn is_turn(&self) -> bool {
        matches!(self, Scheme::Turn | Scheme::Turns)
    }

    /// Returns true for the TLS schemes.
    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Stuns | Scheme::Turns)
    }

    fn default_port(&self) -> u16 {
        if self.is_secure() {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Scheme::Stun => write!(f, "stun"),
            Scheme::Stuns => write!(f, "stuns"),
            Scheme::Turn => write!(f, "turn"),
            Scheme::Turns => write!(f, "turns"),
        }
    }
}

/// Transport used to reach the ICE server.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// Errors raised while parsing an ICE server URL.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IceUrlError {
    #[error("ICE server URL is empty")]
    Empty,
    #[error("ICE server URL has no scheme: {0}")]
    MissingScheme(String),
    #[error("Unknown ICE server URL scheme: {0}")]
    UnknownScheme(String),
    #[error("ICE server URL has no host")]
    MissingHost,
    #[error("Invalid port in ICE server URL: {0}")]
    InvalidPort(String),
    #[error("Query is not allowed for {0} URLs")]
    QueryNotAllowed(Scheme),
    #[error("Invalid query in ICE server URL: {0}")]
    InvalidQuery(String),
    #[error("Unsupported transport: {0}")]
    InvalidTransport(String),
}

/// Parsed `stun:`/`stuns:`/`turn:`/`turns:` URL.
///
/// ```
/// use ice_gather_probe::ice_url::{IceUrl, Scheme, Transport};
/// let url: IceUrl = "turn:turn.example.org?transport=tcp".parse().unwrap();
/// assert_eq!(url.scheme, Scheme::Turn);
/// assert_eq!(url.port, 3478);
/// assert_eq!(url.transport, Transport::Tcp);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

impl IceUrl {
    /// Returns `host:port`, with IPv6 literals bracketed, suitable for name resolution.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for IceUrl {
    type Err = IceUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IceUrlError::Empty);
        }

        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| IceUrlError::MissingScheme(s.to_string()))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "stun" => Scheme::Stun,
            "stuns" => Scheme::Stuns,
            "turn" => Scheme::Turn,
            "turns" => Scheme::Turns,
            other => return Err(IceUrlError::UnknownScheme(other.to_string())),
        };

        let (hostport, query) = match rest.split_once('?') {
            Some((hp, q)) => (hp, Some(q)),
            None => (rest, None),
        };

        let (host, port) = split_host_port(hostport)?;
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| IceUrlError::InvalidPort(p.to_string()))?,
            None => scheme.default_port(),
        };

        let mut transport = if scheme == Scheme::Turns {
            Transport::Tcp
        } else {
            Transport::Udp
        };

        if let Some(query) = query {
            if !scheme.is_turn() {
                return Err(IceUrlError::QueryNotAllowed(scheme));
            }
            let value = query
                .strip_prefix("transport=")
                .ok_or_else(|| IceUrlError::InvalidQuery(query.to_string()))?;
            transport = match value.to_ascii_lowercase().as_str() {
                "udp" => Transport::Udp,
                "tcp" => Transport::Tcp,
                other => return Err(IceUrlError::InvalidTransport(other.to_string())),
            };
        }

        Ok(IceUrl {
            scheme,
            host: host.to_string(),
            port,
            transport,
        })
    }
}

impl fmt::Display for IceUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.authority())?;
        if self.scheme.is_turn() {
            write!(f, "?transport={}", self.transport)?;
        }
        Ok(())
    }
}

fn split_host_port(hostport: &str) -> Result<(&str, Option<&str>), IceUrlError> {
    // Bracketed IPv6 literal, e.g. [::1]:3478
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or(IceUrlError::MissingHost)?;
        if host.is_empty() {
            return Err(IceUrlError::MissingHost);
        }
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(port))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(IceUrlError::InvalidPort(tail.to_string())),
        };
    }

    let (host, port) = match hostport.rsplit_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (hostport, None),
    };
    if host.is_empty() || host.starts_with('/') {
        return Err(IceUrlError::MissingHost);
    }
    Ok((host, port))
}
