//! ICE candidate records.
//!
//! A [`Candidate`] is serialized two ways: as a single-line JSON record (the
//! probe's report format) and as the SDP `candidate:` attribute (RFC 8839).

use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Component id of the RTP component, the only one the probe gathers for.
pub const COMPONENT_RTP: u16 = 1;

/// Local preference used for every candidate (single base per address).
const LOCAL_PREFERENCE: u32 = 65535;

/// Transport protocol of a candidate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Candidate type per RFC 8445 §5.1.1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    /// Address of a local interface.
    Host,
    /// Server-reflexive address learned from a STUN server.
    Srflx,
    /// Peer-reflexive address learned from connectivity checks.
    Prflx,
    /// Address allocated on a TURN relay.
    Relay,
}

impl CandidateType {
    /// Type preference from RFC 8445 §5.1.2.2.
    pub fn preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::Prflx => 110,
            CandidateType::Srflx => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CandidateType::Host => write!(f, "host"),
            CandidateType::Srflx => write!(f, "srflx"),
            CandidateType::Prflx => write!(f, "prflx"),
            CandidateType::Relay => write!(f, "relay"),
        }
    }
}

/// TCP candidate type per RFC 6544.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpType {
    Active,
    Passive,
    So,
}

impl fmt::Display for TcpType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcpType::Active => write!(f, "active"),
            TcpType::Passive => write!(f, "passive"),
            TcpType::So => write!(f, "so"),
        }
    }
}

/// Errors raised while parsing an SDP candidate attribute.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CandidateParseError {
    #[error("Candidate attribute is missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// One discovered ICE candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub foundation: String,
    pub priority: u32,
    pub address: IpAddr,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: CandidateType,
    pub component: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_address: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<TcpType>,
}

impl Candidate {
    /// Creates a host candidate for a locally bound address.
    pub fn host(addr: SocketAddr, protocol: Protocol) -> Self {
        Self::new(CandidateType::Host, addr, protocol, None)
    }

    /// Creates a server-reflexive candidate for `mapped`, learned through a socket bound to `base`.
    pub fn server_reflexive(mapped: SocketAddr, base: SocketAddr) -> Self {
        Self::new(CandidateType::Srflx, mapped, Protocol::Udp, Some(base))
    }

    fn new(
        candidate_type: CandidateType,
        addr: SocketAddr,
        protocol: Protocol,
        related: Option<SocketAddr>,
    ) -> Self {
        Candidate {
            foundation: compute_foundation(candidate_type, addr.ip(), protocol),
            priority: compute_priority(candidate_type, COMPONENT_RTP),
            address: addr.ip(),
            protocol,
            port: addr.port(),
            candidate_type,
            component: COMPONENT_RTP,
            related_address: related.map(|r| r.ip()),
            related_port: related.map(|r| r.port()),
            tcp_type: None,
        }
    }

    /// Serializes the candidate as a single-line JSON record.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Priority per RFC 8445 §5.1.2.1.
pub fn compute_priority(candidate_type: CandidateType, component: u16) -> u32 {
    (candidate_type.preference() << 24) + (LOCAL_PREFERENCE << 8) + (256 - component as u32)
}

fn compute_foundation(candidate_type: CandidateType, ip: IpAddr, protocol: Protocol) -> String {
    let mut hasher = DefaultHasher::new();
    candidate_type.hash(&mut hasher);
    ip.hash(&mut hasher);
    protocol.hash(&mut hasher);
    (hasher.finish() as u32).to_string()
}

impl fmt::Display for Candidate {
    /// Formats the candidate as an SDP `candidate:` attribute value.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.candidate_type
        )?;
        if let (Some(addr), Some(port)) = (self.related_address, self.related_port) {
            write!(f, " raddr {} rport {}", addr, port)?;
        }
        if let Some(tcp_type) = self.tcp_type {
            write!(f, " tcptype {}", tcp_type)?;
        }
        Ok(())
    }
}

impl FromStr for Candidate {
    type Err = CandidateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("a=").unwrap_or(s);
        let s = s.strip_prefix("candidate:").unwrap_or(s);
        let mut fields = s.split_ascii_whitespace();

        let mut next =
            |name: &'static str| fields.next().ok_or(CandidateParseError::MissingField(name));

        let foundation = next("foundation")?.to_string();
        let component = parse_field("component", next("component")?)?;
        let protocol = match next("protocol")?.to_ascii_lowercase().as_str() {
            "udp" => Protocol::Udp,
            "tcp" => Protocol::Tcp,
            other => return Err(invalid("protocol", other)),
        };
        let priority = parse_field("priority", next("priority")?)?;
        let address = parse_field("address", next("address")?)?;
        let port = parse_field("port", next("port")?)?;
        let typ = next("typ")?;
        if typ != "typ" {
            return Err(invalid("typ", typ));
        }
        let candidate_type = match next("type")? {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::Srflx,
            "prflx" => CandidateType::Prflx,
            "relay" => CandidateType::Relay,
            other => return Err(invalid("type", other)),
        };

        let mut candidate = Candidate {
            foundation,
            priority,
            address,
            protocol,
            port,
            candidate_type,
            component,
            related_address: None,
            related_port: None,
            tcp_type: None,
        };

        // Extension attributes come as name/value pairs; unknown ones are skipped.
        while let Some(name) = fields.next() {
            let value = fields.next().ok_or(CandidateParseError::MissingField(
                "extension attribute value",
            ))?;
            match name {
                "raddr" => candidate.related_address = Some(parse_field("raddr", value)?),
                "rport" => candidate.related_port = Some(parse_field("rport", value)?),
                "tcptype" => {
                    candidate.tcp_type = Some(match value {
                        "active" => TcpType::Active,
                        "passive" => TcpType::Passive,
                        "so" => TcpType::So,
                        other => return Err(invalid("tcptype", other)),
                    })
                }
                _ => {}
            }
        }

        Ok(candidate)
    }
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, CandidateParseError> {
    value.parse().map_err(|_| invalid(field, value))
}

fn invalid(field: &'static str, value: &str) -> CandidateParseError {
    CandidateParseError::InvalidField {
        field,
        value: value.to_string(),
    }
}
