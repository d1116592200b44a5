use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pnet::packet::icmp::destination_unreachable::DestinationUnreachablePacket;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{self, EchoRequestPacket, MutableEchoRequestPacket};
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use pnet::util;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};

use crate::error::{ProbeError, Result};
use crate::lifecycle;
use crate::outcome::{ProbeOutcome, ProbePayload};
use crate::probe::Prober;

/// Number of filler bytes sent in the echo request by default.
pub const DEFAULT_DATA_SIZE: usize = 56;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REPLY: usize = 1500;

/// Distinguishes this instance's echo requests from any other instance in
/// the same process.
static INSTANCE_SALT: AtomicU16 = AtomicU16::new(0);

/// Probes a host with a raw ICMP echo request.
///
/// Requires raw-socket privileges; [`IcmpProbe::available`] reports whether
/// this environment grants them, and the builder refuses to construct the
/// probe when it does not. Each attempt sends one echo request and accepts
/// only the echo reply carrying this probe's identifier and the attempt's
/// sequence number, so concurrent probes (and unrelated ICMP chatter) do
/// not cross-match.
#[derive(Debug)]
pub struct IcmpProbe {
    host: Option<String>,
    timeout: Option<Duration>,
    data_size: usize,
    bind_host: Option<String>,
    bind_port: u16,
    identifier: u16,
    sequence: AtomicU16,
}

#[derive(Clone, Debug, Default)]
pub struct IcmpProbeBuilder {
    host: Option<String>,
    timeout: Option<Duration>,
    data_size: Option<usize>,
    bind_host: Option<String>,
    bind_port: u16,
}

impl IcmpProbeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of filler bytes to send in the echo request.
    pub fn with_data_size(mut self, data_size: usize) -> Self {
        self.data_size = Some(data_size);
        self
    }

    /// Associate the local end of the socket with the given host and port.
    pub fn with_bind(mut self, host: &str, port: u16) -> Self {
        self.bind_host = Some(host.to_string());
        self.bind_port = port;
        self
    }

    /// # Errors
    /// [`Error::NotSupported`](crate::Error::NotSupported) when this
    /// environment cannot open raw ICMP sockets, unless force-enabled.
    pub fn build(self) -> Result<IcmpProbe> {
        lifecycle::ensure_available(IcmpProbe::not_available_reason())?;
        Ok(IcmpProbe {
            host: self.host,
            timeout: Some(self.timeout.unwrap_or(DEFAULT_TIMEOUT)),
            data_size: self.data_size.unwrap_or(DEFAULT_DATA_SIZE),
            bind_host: self.bind_host,
            bind_port: self.bind_port,
            identifier: next_identifier(),
            sequence: AtomicU16::new(0),
        })
    }
}

/// Call-time overrides; a set field wins over the instance configuration.
#[derive(Clone, Debug, Default)]
pub struct IcmpOverrides {
    pub timeout: Option<Duration>,
    pub data_size: Option<usize>,
    pub bind_host: Option<String>,
    pub bind_port: Option<u16>,
}

impl IcmpProbe {
    pub fn builder() -> IcmpProbeBuilder {
        IcmpProbeBuilder::new()
    }

    pub fn new(host: &str) -> Result<Self> {
        Self::builder().with_host(host).build()
    }
}

#[async_trait]
impl Prober for IcmpProbe {
    type Overrides = IcmpOverrides;

    fn not_available_reason() -> Option<String> {
        if !cfg!(unix) {
            return Some(
                "ICMP probing with raw sockets is only supported on Unix-like platforms"
                    .to_string(),
            );
        }
        match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
            Ok(_) => None,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Some(
                "ICMP probing requires raw-socket privileges (root or CAP_NET_RAW)".to_string(),
            ),
            Err(err) => Some(format!("raw ICMP sockets are unavailable: {err}")),
        }
    }

    async fn probe_with(
        &self,
        host: Option<&str>,
        overrides: IcmpOverrides,
    ) -> Result<ProbeOutcome> {
        let host = lifecycle::resolve_host(host, self.host.as_deref())?;
        let limit = lifecycle::resolve_timeout(overrides.timeout, self.timeout)?;
        let data_size = overrides.data_size.unwrap_or(self.data_size);
        let bind_host = overrides.bind_host.or_else(|| self.bind_host.clone());
        let bind_port = overrides.bind_port.unwrap_or(self.bind_port);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        // Resolution failures bail without waiting out the deadline.
        let target = match ipv4_addr(host).await {
            Ok(target) => target,
            Err(err) => return Ok(ProbeOutcome::failed(err)),
        };
        let bind_addr = match &bind_host {
            None => None,
            Some(bind_host) => match ipv4_addr(bind_host).await {
                Ok(addr) => Some(SocketAddr::new(IpAddr::V4(addr), bind_port)),
                Err(err) => return Ok(ProbeOutcome::failed(err)),
            },
        };

        let socket = match open_socket(bind_addr).and_then(UdpSocket::from_std) {
            Ok(socket) => socket,
            Err(err) => return Ok(ProbeOutcome::failed(ProbeError::io(&err))),
        };

        let request = build_echo_request(self.identifier, sequence, data_size);
        let started = Instant::now();
        let deadline = started + limit;

        // Unreachable networks surface here; no point waiting afterwards.
        let destination = SocketAddr::new(IpAddr::V4(target), 0);
        if let Err(err) = socket.send_to(&request, destination).await {
            return Ok(ProbeOutcome::failed(ProbeError::io(&err)));
        }

        // Background ICMP traffic interleaves freely on a raw socket, so
        // keep reading until the matching reply or the deadline.
        let mut buf = vec![0u8; MAX_REPLY];
        loop {
            let received = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => return Ok(ProbeOutcome::failed(ProbeError::Timeout)),
                Ok(Err(err)) => return Ok(ProbeOutcome::failed(ProbeError::io(&err))),
                Ok(Ok((received, _))) => received,
            };
            if reply_matches(&buf[..received], self.identifier, sequence) {
                return Ok(ProbeOutcome::succeeded(started.elapsed())
                    .with_response(ProbePayload::Bytes(buf[..received].to_vec())));
            }
        }
    }
}

fn next_identifier() -> u16 {
    (std::process::id() as u16) ^ INSTANCE_SALT.fetch_add(1, Ordering::Relaxed)
}

async fn ipv4_addr(host: &str) -> std::result::Result<Ipv4Addr, ProbeError> {
    match lookup_host((host, 0u16)).await {
        Err(err) => Err(ProbeError::resolution(&err)),
        Ok(addrs) => {
            for addr in addrs {
                if let SocketAddr::V4(v4) = addr {
                    return Ok(*v4.ip());
                }
            }
            Err(ProbeError::Resolution(format!(
                "no IPv4 address found for {host}"
            )))
        }
    }
}

fn open_socket(bind: Option<SocketAddr>) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(true)?;
    if let Some(addr) = bind {
        socket.bind(&SockAddr::from(addr))?;
    }
    Ok(socket.into())
}

/// Encode one echo request: deterministic filler payload, checksum computed
/// over the whole message with the checksum field zeroed.
fn build_echo_request(identifier: u16, sequence: u16, data_size: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..data_size).map(|n| (n % 256) as u8).collect();
    let mut buf = vec![0u8; EchoRequestPacket::minimum_packet_size() + data_size];
    let mut request = MutableEchoRequestPacket::new(&mut buf).unwrap();
    request.set_icmp_type(IcmpTypes::EchoRequest);
    request.set_icmp_code(echo_request::IcmpCodes::NoCode);
    request.set_identifier(identifier);
    request.set_sequence_number(sequence);
    request.set_payload(&payload);
    request.set_checksum(util::checksum(request.packet(), 1));
    buf
}

/// Whether a received IP datagram is the echo reply for this attempt.
///
/// ICMP error messages embed the original datagram; their identifier and
/// sequence are extracted for diagnostics, but only a matching echo reply
/// is ever accepted.
fn reply_matches(datagram: &[u8], identifier: u16, sequence: u16) -> bool {
    let ip = match Ipv4Packet::new(datagram) {
        Some(ip) => ip,
        None => return false,
    };
    let icmp = match IcmpPacket::new(ip.payload()) {
        Some(icmp) => icmp,
        None => return false,
    };
    match icmp.get_icmp_type() {
        IcmpTypes::EchoReply => match EchoReplyPacket::new(ip.payload()) {
            Some(reply) => {
                reply.get_identifier() == identifier
                    && reply.get_sequence_number() == sequence
            }
            None => false,
        },
        other => {
            if let Some((embedded_identifier, embedded_sequence)) = embedded_ids(&icmp) {
                if embedded_identifier == identifier && embedded_sequence == sequence {
                    log::debug!("echo request answered with {other:?}");
                }
            }
            false
        }
    }
}

fn embedded_ids(icmp: &IcmpPacket) -> Option<(u16, u16)> {
    match icmp.get_icmp_type() {
        IcmpTypes::DestinationUnreachable => {
            let packet = DestinationUnreachablePacket::new(icmp.packet())?;
            ids_of_embedded(packet.payload())
        }
        IcmpTypes::TimeExceeded => {
            let packet = TimeExceededPacket::new(icmp.packet())?;
            ids_of_embedded(packet.payload())
        }
        _ => None,
    }
}

fn ids_of_embedded(embedded: &[u8]) -> Option<(u16, u16)> {
    let inner = Ipv4Packet::new(embedded)?;
    let request = EchoRequestPacket::new(inner.payload())?;
    Some((request.get_identifier(), request.get_sequence_number()))
}
