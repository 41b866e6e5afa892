use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tokio::{net::UdpSocket, runtime::Handle, task::JoinHandle};

use super::{DiscoveryEngine, EngineError, GathererState};
use crate::{
    candidate::{Candidate, Protocol},
    ice_url::{IceUrl, Transport},
    sink::EventSink,
    stun::{query_binding, StunPolicy},
};

/// Tunables for [`IceGatherer`].
#[derive(Copy, Clone, Debug, Default)]
pub struct GatherOptions {
    pub stun: StunPolicy,
    /// Gather host candidates on global/unique-local IPv6 addresses too.
    pub include_ipv6: bool,
}

/// Gathers host candidates from local interfaces and one server-reflexive
/// candidate from the configured STUN/TURN server.
///
/// Relay allocation is not performed: a `turn:` server is only asked for a
/// Binding, which TURN servers answer like any STUN server.
pub struct IceGatherer {
    url: IceUrl,
    options: GatherOptions,
    state: GathererState,
    runtime: Handle,
    worker: Option<JoinHandle<()>>,
}

impl IceGatherer {
    /// Creates a gatherer bound to `server` on the current tokio runtime.
    ///
    /// Fails if the URL does not parse or no runtime is running.
    pub fn new(server: &str, options: GatherOptions) -> Result<IceGatherer, EngineError> {
        let url: IceUrl = server.parse()?;
        let runtime = Handle::try_current()?;
        log::debug!("gatherer created for {}", url);
        Ok(IceGatherer {
            url,
            options,
            state: GathererState::New,
            runtime,
            worker: None,
        })
    }

    pub fn url(&self) -> &IceUrl {
        &self.url
    }
}

impl DiscoveryEngine for IceGatherer {
    fn start_gathering(&mut self, sink: EventSink) -> Result<(), EngineError> {
        match self.state {
            GathererState::New => {}
            GathererState::Closed => return Err(EngineError::Closed),
            _ => return Err(EngineError::AlreadyStarted),
        }
        self.state = GathererState::Gathering;
        sink.on_state_change(GathererState::Gathering);
        self.worker = Some(self.runtime.spawn(gather(self.url.clone(), self.options, sink)));
        Ok(())
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            if !worker.is_finished() {
                log::debug!("aborting gathering for {}", self.url);
            }
            worker.abort();
        }
        self.state = GathererState::Closed;
    }
}

impl Drop for IceGatherer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn gather(url: IceUrl, options: GatherOptions, sink: EventSink) {
    // Host sockets stay bound until gathering ends so their ports remain valid.
    let (_host_sockets, ()) = tokio::join!(
        gather_host(options.include_ipv6, &sink),
        gather_server_reflexive(&url, options, &sink),
    );

    sink.on_candidate(None);
    sink.on_state_change(GathererState::Complete);
}

async fn gather_host(include_ipv6: bool, sink: &EventSink) -> Vec<UdpSocket> {
    let interfaces = match NetworkInterface::show() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            log::warn!("cannot enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut sockets = Vec::new();
    for iface in interfaces {
        for addr in iface.addr {
            let ip = addr.ip();
            if !usable_host_address(ip, include_ipv6) || !seen.insert(ip) {
                continue;
            }
            match UdpSocket::bind(SocketAddr::new(ip, 0)).await {
                Ok(socket) => match socket.local_addr() {
                    Ok(local) => {
                        sink.on_candidate(Some(Candidate::host(local, Protocol::Udp)));
                        sockets.push(socket);
                    }
                    Err(e) => log::warn!("cannot read local address on {}: {}", iface.name, e),
                },
                Err(e) => log::warn!("cannot bind {} on {}: {}", ip, iface.name, e),
            }
        }
    }
    sockets
}

fn usable_host_address(ip: IpAddr, include_ipv6: bool) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return false;
    }
    match ip {
        IpAddr::V4(_) => true,
        // Link-local addresses need a scope id to bind.
        IpAddr::V6(v6) => include_ipv6 && (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

async fn gather_server_reflexive(url: &IceUrl, options: GatherOptions, sink: &EventSink) {
    if url.transport != Transport::Udp || url.scheme.is_secure() {
        log::warn!("skipping {}: only plain UDP servers are queried", url);
        return;
    }
    if url.scheme.is_turn() {
        log::info!("relay allocation not performed, querying {} for a reflexive address", url);
    }

    let server = match tokio::net::lookup_host(url.authority()).await {
        Ok(mut addrs) => match addrs.find(|a| a.is_ipv4() || options.include_ipv6) {
            Some(addr) => addr,
            None => {
                log::warn!("{} did not resolve to a usable address", url.host);
                return;
            }
        },
        Err(e) => {
            log::warn!("cannot resolve {}: {}", url.host, e);
            return;
        }
    };

    let wildcard: IpAddr = if server.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let socket = match UdpSocket::bind(SocketAddr::new(wildcard, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            log::warn!("cannot bind reflexive query socket: {}", e);
            return;
        }
    };
    let base = match socket.local_addr() {
        Ok(base) => base,
        Err(e) => {
            log::warn!("cannot read reflexive query socket address: {}", e);
            return;
        }
    };

    match query_binding(&socket, server, options.stun).await {
        Ok(mapped) => sink.on_candidate(Some(Candidate::server_reflexive(mapped, base))),
        Err(e) => log::warn!("reflexive discovery via {} failed: {}", server, e),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        barrier::DrainBarrier,
        candidate::CandidateType,
        gate::{CompletionGate, GateOutcome},
        session::SessionClock,
        stun::STUN_HEADER_SIZE,
    };

    fn sink() -> (EventSink, crate::sink::EventStream, CompletionGate) {
        let (signal, gate) = CompletionGate::channel();
        let (sink, stream) = EventSink::new(
            Arc::new(SessionClock::new()),
            Arc::new(DrainBarrier::new()),
            signal,
        );
        (sink, stream, gate)
    }

    #[tokio::test]
    async fn test_new_rejects_bad_urls() {
        assert!(matches!(
            IceGatherer::new("", GatherOptions::default()),
            Err(EngineError::InvalidUrl(_))
        ));
        assert!(matches!(
            IceGatherer::new("http://example.org", GatherOptions::default()),
            Err(EngineError::InvalidUrl(_))
        ));
        let g = IceGatherer::new("stun:127.0.0.1:3478", GatherOptions::default()).unwrap();
        assert_eq!(g.url().port, 3478);
    }

    #[test]
    fn test_usable_host_address() {
        assert!(usable_host_address("192.168.1.4".parse().unwrap(), false));
        assert!(!usable_host_address("127.0.0.1".parse().unwrap(), false));
        assert!(!usable_host_address("0.0.0.0".parse().unwrap(), false));
        assert!(!usable_host_address("2001:db8::1".parse().unwrap(), false));
        assert!(usable_host_address("2001:db8::1".parse().unwrap(), true));
        assert!(!usable_host_address("fe80::1".parse().unwrap(), true));
        assert!(!usable_host_address("::1".parse().unwrap(), true));
    }

    #[test]
    fn test_new_requires_runtime() {
        assert!(matches!(
            IceGatherer::new("stun:127.0.0.1:3478", GatherOptions::default()),
            Err(EngineError::NoRuntime(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_and_after_close() {
        let opts = GatherOptions {
            stun: StunPolicy {
                timeout: Duration::from_millis(10),
                retries: 0,
            },
            include_ipv6: false,
        };
        let mut g = IceGatherer::new("stun:127.0.0.1:9", opts).unwrap();
        let (s1, _stream1, _gate1) = sink();
        let (s2, _stream2, _gate2) = sink();
        g.start_gathering(s1).unwrap();
        assert!(matches!(
            g.start_gathering(s2.clone()),
            Err(EngineError::AlreadyStarted)
        ));
        g.close();
        g.close();
        assert!(matches!(g.start_gathering(s2), Err(EngineError::Closed)));
    }

    #[tokio::test]
    async fn test_close_releases_sink() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let opts = GatherOptions {
            stun: StunPolicy {
                timeout: Duration::from_secs(5),
                retries: 3,
            },
            include_ipv6: false,
        };
        let url = format!("stun:{}", silent.local_addr().unwrap());
        let mut g = IceGatherer::new(&url, opts).unwrap();
        let (s, mut stream, _gate) = sink();
        g.start_gathering(s).unwrap();
        g.close();

        // Aborting the worker drops the last sink clone, closing the stream.
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            while stream.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn test_gathers_reflexive_then_sentinel_then_complete() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("stun:{}", server.local_addr().unwrap());

        // Answer the first binding request with a fixed mapped address.
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, src) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, STUN_HEADER_SIZE);
            let mut resp = vec![0x01, 0x01, 0x00, 0x0C, 0x21, 0x12, 0xA4, 0x42];
            resp.extend_from_slice(&buf[8..20]);
            // XOR-MAPPED-ADDRESS 198.51.100.9:40000
            resp.extend_from_slice(&[0x00, 0x20, 0x00, 0x08, 0x00, 0x01]);
            resp.extend_from_slice(&(40000u16 ^ 0x2112).to_be_bytes());
            let mapped = u32::from(Ipv4Addr::new(198, 51, 100, 9)) ^ 0x2112_A442;
            resp.extend_from_slice(&mapped.to_be_bytes());
            server.send_to(&resp, src).await.unwrap();
        });

        let mut g = IceGatherer::new(&url, GatherOptions::default()).unwrap();
        let (s, mut stream, mut gate) = sink();
        g.start_gathering(s).unwrap();

        assert_eq!(gate.wait(Duration::from_secs(5)).await, GateOutcome::Completed);
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        responder.await.unwrap();

        let last = events.last().unwrap();
        assert!(last.is_end_of_candidates());
        let srflx: Vec<_> = events
            .iter()
            .filter_map(|e| e.candidate())
            .filter(|c| c.candidate_type == CandidateType::Srflx)
            .collect();
        assert_eq!(srflx.len(), 1);
        assert_eq!(srflx[0].address, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)));
        assert_eq!(srflx[0].port, 40000);
        assert_eq!(srflx[0].related_address, Some(Ipv4Addr::UNSPECIFIED.into()));
    }
}
