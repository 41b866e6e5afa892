//! Minimal STUN Binding client (RFC 5389) used to learn server-reflexive addresses.
//!
//! Only the Binding method over UDP is implemented: a 20-byte request without
//! attributes, and response parsing for XOR-MAPPED-ADDRESS with MAPPED-ADDRESS
//! as the legacy fallback.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use thiserror::Error;
use tokio::net::UdpSocket;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const MAGIC_COOKIE_PORT_XOR: u16 = (MAGIC_COOKIE >> 16) as u16;

/// STUN header size in bytes.
pub const STUN_HEADER_SIZE: usize = 20;

const ADDRESS_FAMILY_IPV4: u8 = 0x01;
const ADDRESS_FAMILY_IPV6: u8 = 0x02;

/// Errors returned by the STUN client.
#[derive(Error, Debug)]
pub enum StunError {
    #[error("STUN socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("STUN server {server} did not respond after {attempts} attempts")]
    Timeout { server: SocketAddr, attempts: u32 },
    #[error("STUN server returned a Binding Error Response")]
    ErrorResponse,
    #[error("Malformed STUN response: {0}")]
    Malformed(String),
}

/// Retransmission policy for a single Binding transaction.
#[derive(Copy, Clone, Debug)]
pub struct StunPolicy {
    /// Time to wait for a response to each transmission.
    pub timeout: Duration,
    /// Number of retransmissions after the first request.
    pub retries: u32,
}

impl Default for StunPolicy {
    fn default() -> Self {
        StunPolicy {
            timeout: Duration::from_millis(500),
            retries: 2,
        }
    }
}

/// A Binding request with its transaction id.
pub struct BindingRequest {
    transaction_id: [u8; 12],
}

impl BindingRequest {
    /// Creates a request with a random transaction id.
    pub fn new() -> Self {
        BindingRequest {
            transaction_id: rand::random(),
        }
    }

    #[cfg(test)]
    fn with_transaction_id(transaction_id: [u8; 12]) -> Self {
        BindingRequest { transaction_id }
    }

    /// Encodes the request header.
    pub fn to_bytes(&self) -> [u8; STUN_HEADER_SIZE] {
        let mut msg = [0u8; STUN_HEADER_SIZE];
        msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
        // Message length stays 0, no attributes.
        msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg[8..20].copy_from_slice(&self.transaction_id);
        msg
    }

    /// Parses a Binding response to this request and returns the mapped address.
    pub fn parse_response(&self, data: &[u8]) -> Result<SocketAddr, StunError> {
        if data.len() < STUN_HEADER_SIZE {
            return Err(StunError::Malformed(format!(
                "response too short: {} bytes",
                data.len()
            )));
        }

        let msg_type = u16::from_be_bytes([data[0], data[1]]);
        if msg_type == BINDING_ERROR {
            return Err(StunError::ErrorResponse);
        }
        if msg_type != BINDING_RESPONSE {
            return Err(StunError::Malformed(format!(
                "unexpected message type: 0x{:04X}",
                msg_type
            )));
        }

        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::Malformed(format!(
                "invalid magic cookie: 0x{:08X}",
                cookie
            )));
        }

        if data[8..20] != self.transaction_id {
            return Err(StunError::Malformed("transaction ID mismatch".to_string()));
        }

        let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < STUN_HEADER_SIZE + msg_len {
            return Err(StunError::Malformed(format!(
                "message length {} exceeds available data {}",
                msg_len,
                data.len() - STUN_HEADER_SIZE
            )));
        }

        let attrs = &data[STUN_HEADER_SIZE..STUN_HEADER_SIZE + msg_len];
        let mut xor_mapped = None;
        let mut mapped = None;

        let mut offset = 0;
        while offset + 4 <= attrs.len() {
            let attr_type = u16::from_be_bytes([attrs[offset], attrs[offset + 1]]);
            let attr_len = u16::from_be_bytes([attrs[offset + 2], attrs[offset + 3]]) as usize;
            let start = offset + 4;
            if start + attr_len > attrs.len() {
                break;
            }
            let value = &attrs[start..start + attr_len];

            match attr_type {
                ATTR_XOR_MAPPED_ADDRESS => {
                    xor_mapped = Some(decode_address(value, Some(&self.transaction_id))?)
                }
                ATTR_MAPPED_ADDRESS => mapped = Some(decode_address(value, None)?),
                _ => {}
            }

            // Attributes are padded to 4-byte boundaries.
            offset = start + ((attr_len + 3) & !3);
        }

        xor_mapped.or(mapped).ok_or_else(|| {
            StunError::Malformed("no XOR-MAPPED-ADDRESS or MAPPED-ADDRESS".to_string())
        })
    }
}

impl Default for BindingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a (XOR-)MAPPED-ADDRESS value. `xor_key` is the transaction id for the XOR form.
fn decode_address(data: &[u8], xor_key: Option<&[u8; 12]>) -> Result<SocketAddr, StunError> {
    if data.len() < 8 {
        return Err(StunError::Malformed(format!(
            "address attribute too short: {} bytes",
            data.len()
        )));
    }

    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if xor_key.is_some() {
        port ^= MAGIC_COOKIE_PORT_XOR;
    }

    let ip = match family {
        ADDRESS_FAMILY_IPV4 => {
            let mut raw = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            if xor_key.is_some() {
                raw ^= MAGIC_COOKIE;
            }
            IpAddr::V4(Ipv4Addr::from(raw))
        }
        ADDRESS_FAMILY_IPV6 => {
            if data.len() < 20 {
                return Err(StunError::Malformed(
                    "IPv6 address attribute too short".to_string(),
                ));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            if let Some(tid) = xor_key {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                key[4..].copy_from_slice(tid);
                for (b, k) in octets.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(StunError::Malformed(format!(
                "unknown address family: 0x{:02X}",
                other
            )))
        }
    };

    Ok(SocketAddr::new(ip, port))
}

/// Runs one Binding transaction against `server` and returns the reflexive address.
///
/// The same request is retransmitted on every attempt. Datagrams from other
/// sources or that fail to parse as a response to this transaction are ignored.
pub async fn query_binding(
    socket: &UdpSocket,
    server: SocketAddr,
    policy: StunPolicy,
) -> Result<SocketAddr, StunError> {
    let request = BindingRequest::new();
    let bytes = request.to_bytes();
    let mut buf = [0u8; 576];

    for attempt in 0..=policy.retries {
        socket.send_to(&bytes, server).await?;
        log::debug!("STUN binding request sent to {} (attempt {})", server, attempt + 1);

        let deadline = tokio::time::Instant::now() + policy.timeout;
        loop {
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, src))) if src == server => match request.parse_response(&buf[..len]) {
                    Ok(addr) => return Ok(addr),
                    Err(StunError::ErrorResponse) => return Err(StunError::ErrorResponse),
                    Err(e) => log::debug!("Ignoring datagram from {}: {}", src, e),
                },
                Ok(Ok((_, src))) => log::debug!("Ignoring datagram from unexpected source {}", src),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }
    }

    Err(StunError::Timeout {
        server,
        attempts: policy.retries + 1,
    })
}
