use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};

use crate::error::{Error, ProbeError, Result};
use crate::lifecycle;
use crate::outcome::{ProbeOutcome, ProbePayload};
use crate::probe::Prober;

/// Largest payload that may be sent in a datagram probe.
pub const MAX_DATA: usize = 64;

/// The marker sent by default; echo servers send it straight back.
pub const DEFAULT_DATA: &[u8] = b"async-probe\n";

const DEFAULT_PORT: u16 = 7;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes a host by sending a datagram and waiting for an echo.
///
/// Unless `data_must_match` is disabled, success requires the reply to
/// carry exactly the payload that was sent; the check auto-enables for the
/// standard echo port (7) and auto-disables for any other port, an explicit
/// setting always winning. A port-unreachable refusal counts as success
/// unless `service_check` is on, which is implied when a port is configured
/// explicitly.
#[derive(Clone, Debug)]
pub struct UdpProbe {
    host: Option<String>,
    port: u16,
    port_is_explicit: bool,
    timeout: Option<Duration>,
    data: Vec<u8>,
    service_check: Option<bool>,
    data_must_match: Option<bool>,
    bind_host: Option<String>,
    bind_port: u16,
}

#[derive(Clone, Debug, Default)]
pub struct UdpProbeBuilder {
    host: Option<String>,
    port: Option<u16>,
    timeout: Option<Duration>,
    data: Option<Vec<u8>>,
    service_check: Option<bool>,
    data_must_match: Option<bool>,
    bind_host: Option<String>,
    bind_port: u16,
}

impl UdpProbeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// Configuring a port explicitly implies `service_check`, and drives
    /// the `data_must_match` default (on for the echo port, off otherwise).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Payload to send, at most [`MAX_DATA`] bytes.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Whether a port-unreachable refusal fails the probe instead of
    /// counting as host reachability.
    pub fn with_service_check(mut self, service_check: bool) -> Self {
        self.service_check = Some(service_check);
        self
    }

    /// Explicitly require (or waive) the reply matching the sent payload.
    pub fn with_data_must_match(mut self, data_must_match: bool) -> Self {
        self.data_must_match = Some(data_must_match);
        self
    }

    /// Associate the local end of the socket with the given host and port.
    pub fn with_bind(mut self, host: &str, port: u16) -> Self {
        self.bind_host = Some(host.to_string());
        self.bind_port = port;
        self
    }

    pub fn build(self) -> Result<UdpProbe> {
        if let Some(data) = &self.data {
            if data.len() > MAX_DATA {
                return Err(Error::DataTooLarge { max: MAX_DATA });
            }
        }
        Ok(UdpProbe {
            host: self.host,
            port: self.port.unwrap_or(DEFAULT_PORT),
            port_is_explicit: self.port.is_some(),
            timeout: Some(self.timeout.unwrap_or(DEFAULT_TIMEOUT)),
            data: self.data.unwrap_or_else(|| DEFAULT_DATA.to_vec()),
            service_check: self.service_check,
            data_must_match: self.data_must_match,
            bind_host: self.bind_host,
            bind_port: self.bind_port,
        })
    }
}

/// Call-time overrides; a set field wins over the instance configuration.
#[derive(Clone, Debug, Default)]
pub struct UdpOverrides {
    pub port: Option<u16>,
    pub timeout: Option<Duration>,
    pub data: Option<Vec<u8>>,
    pub service_check: Option<bool>,
    pub data_must_match: Option<bool>,
    pub bind_host: Option<String>,
    pub bind_port: Option<u16>,
}

impl UdpProbe {
    pub fn builder() -> UdpProbeBuilder {
        UdpProbeBuilder::new()
    }

    pub fn new(host: &str) -> Result<Self> {
        Self::builder().with_host(host).build()
    }
}

#[async_trait]
impl Prober for UdpProbe {
    type Overrides = UdpOverrides;

    async fn probe_with(
        &self,
        host: Option<&str>,
        overrides: UdpOverrides,
    ) -> Result<ProbeOutcome> {
        let host = lifecycle::resolve_host(host, self.host.as_deref())?;
        let timeout = lifecycle::resolve_timeout(overrides.timeout, self.timeout)?;
        let port = overrides.port.unwrap_or(self.port);
        let data = match overrides.data {
            Some(data) => {
                if data.len() > MAX_DATA {
                    return Err(Error::DataTooLarge { max: MAX_DATA });
                }
                data
            }
            None => self.data.clone(),
        };
        let service_check = overrides
            .service_check
            .or(self.service_check)
            .unwrap_or(overrides.port.is_some() || self.port_is_explicit);
        let data_must_match = overrides
            .data_must_match
            .or(self.data_must_match)
            .unwrap_or(port == DEFAULT_PORT);
        let bind_host = overrides.bind_host.or_else(|| self.bind_host.clone());
        let bind_port = overrides.bind_port.unwrap_or(self.bind_port);

        let addr = match first_addr(host, port).await {
            Ok(addr) => addr,
            Err(err) => return Ok(ProbeOutcome::failed(err)),
        };

        let local: SocketAddr = match &bind_host {
            Some(bind_host) => match first_addr(bind_host, bind_port).await {
                Ok(local) => local,
                Err(err) => return Ok(ProbeOutcome::failed(err)),
            },
            None if addr.is_ipv4() => SocketAddr::from(([0, 0, 0, 0], 0)),
            None => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = match UdpSocket::bind(local).await {
            Ok(socket) => socket,
            Err(err) => return Ok(ProbeOutcome::failed(ProbeError::io(&err))),
        };

        let started = Instant::now();
        let deadline = started + timeout;

        // A datagram connect fixes the peer so refusals surface on the
        // following send or receive.
        if let Err(err) = socket.connect(addr).await {
            return Ok(refusal_or_failure(&err, service_check, started));
        }
        if let Err(err) = socket.send(&data).await {
            return Ok(refusal_or_failure(&err, service_check, started));
        }

        let mut buf = vec![0u8; MAX_DATA];
        match timeout_at(deadline, socket.recv(&mut buf)).await {
            Err(_) => Ok(ProbeOutcome::failed(ProbeError::Timeout)),
            Ok(Err(err)) => Ok(refusal_or_failure(&err, service_check, started)),
            Ok(Ok(n)) => {
                buf.truncate(n);
                let outcome = if !data_must_match || buf == data {
                    ProbeOutcome::succeeded(started.elapsed())
                } else {
                    ProbeOutcome::failed(ProbeError::DataMismatch)
                };
                Ok(outcome.with_response(ProbePayload::Bytes(buf)))
            }
        }
    }
}

async fn first_addr(host: &str, port: u16) -> std::result::Result<SocketAddr, ProbeError> {
    match lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next().ok_or_else(|| {
            ProbeError::Resolution(format!("no addresses found for {host}"))
        }),
        Err(err) => Err(ProbeError::resolution(&err)),
    }
}

fn refusal_or_failure(err: &io::Error, service_check: bool, started: Instant) -> ProbeOutcome {
    let refusal = matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    );
    if !refusal {
        ProbeOutcome::failed(ProbeError::io(err))
    } else if service_check {
        ProbeOutcome::failed(ProbeError::Refused)
    } else {
        ProbeOutcome::succeeded(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::assert_terminal_invariant;

    async fn echo_server() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATA];
            loop {
                if let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                    let _ = socket.send_to(&buf[..n], peer).await;
                }
            }
        });
        port
    }

    async fn mangling_server() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATA];
            loop {
                if let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                    let _ = socket.send_to(b"????", peer).await;
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn a_faithful_echo_succeeds_when_data_must_match() {
        let port = echo_server().await;
        let probe = UdpProbe::builder()
            .with_host("127.0.0.1")
            .with_port(port)
            .with_data_must_match(true)
            .build()
            .unwrap();

        let outcome = probe.probe().await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.response().unwrap().as_bytes(), DEFAULT_DATA);
        assert_terminal_invariant(&outcome);
    }

    #[tokio::test]
    async fn a_mangled_echo_fails_when_data_must_match() {
        let port = mangling_server().await;
        let probe = UdpProbe::builder()
            .with_host("127.0.0.1")
            .with_port(port)
            .with_data_must_match(true)
            .build()
            .unwrap();

        let outcome = probe.probe().await.unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.error(), Some(&ProbeError::DataMismatch));
        assert_eq!(outcome.response().unwrap().as_bytes(), b"????");
        assert_terminal_invariant(&outcome);
    }

    #[tokio::test]
    async fn any_reply_counts_without_data_must_match() {
        let port = mangling_server().await;
        let probe = UdpProbe::builder()
            .with_host("127.0.0.1")
            .with_port(port)
            .build()
            .unwrap();

        // A non-echo port auto-disables the match requirement.
        let outcome = probe.probe().await.unwrap();
        assert!(outcome.success());
        assert_terminal_invariant(&outcome);
    }

    #[tokio::test]
    async fn a_silent_peer_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let probe = UdpProbe::builder()
            .with_host("127.0.0.1")
            .with_port(port)
            .with_timeout(Duration::from_millis(300))
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let outcome = probe.probe().await.unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.error(), Some(&ProbeError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_terminal_invariant(&outcome);
    }

    #[tokio::test]
    async fn a_refusal_is_reachability_without_service_check() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        drop(socket);

        let probe = UdpProbe::builder()
            .with_host("127.0.0.1")
            .with_port(port)
            .with_service_check(false)
            .with_timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        let outcome = probe.probe().await.unwrap();
        assert!(outcome.success());
        assert_terminal_invariant(&outcome);
    }

    #[tokio::test]
    async fn a_refusal_fails_with_service_check() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        drop(socket);

        let probe = UdpProbe::builder()
            .with_host("127.0.0.1")
            .with_port(port)
            .with_timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        // The explicit port implies the service check.
        let outcome = probe.probe().await.unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.error(), Some(&ProbeError::Refused));
        assert_terminal_invariant(&outcome);
    }

    #[tokio::test]
    async fn oversized_data_is_rejected_when_configured() {
        let result = UdpProbe::builder()
            .with_host("127.0.0.1")
            .with_data(vec![0u8; MAX_DATA + 1])
            .build();
        assert!(matches!(result, Err(Error::DataTooLarge { max: MAX_DATA })));
    }

    #[tokio::test]
    async fn call_time_data_must_match_wins_over_the_auto_default() {
        let port = mangling_server().await;
        let probe = UdpProbe::new("127.0.0.1").unwrap();

        let outcome = probe
            .probe_with(
                None,
                UdpOverrides {
                    port: Some(port),
                    data_must_match: Some(true),
                    ..UdpOverrides::default()
                },
            )
            .await
            .unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.error(), Some(&ProbeError::DataMismatch));
    }

    #[test]
    fn the_default_payload_fits_the_limit() {
        assert!(DEFAULT_DATA.len() <= MAX_DATA);
    }
}
