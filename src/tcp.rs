use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout_at, Instant};

use crate::error::{Error, ProbeError, Result};
use crate::lifecycle;
use crate::outcome::{ProbeOutcome, ProbePayload};
use crate::probe::Prober;

/// Largest payload that may be sent on a stream probe. We are not trying to
/// be a client, just a ping.
pub const MAX_DATA: usize = 1024;

const DEFAULT_PORT: u16 = 80;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Probes a host by opening a stream connection to a port.
///
/// Establishing the connection is the liveness signal; with `data`
/// configured, the probe also sends it and records whatever comes back as
/// the response payload. A refused connection counts as success unless the
/// probe is checking the service itself (`service_check`), which is implied
/// when a port or data is configured explicitly.
///
/// # Example
/// ```no_run
/// use async_probe::{Prober, TcpProbe};
///
/// tokio_test::block_on(async {
///     let probe = TcpProbe::builder()
///         .with_host("192.168.1.1")
///         .with_port(22)
///         .build()
///         .unwrap();
///     assert!(probe.is_alive().await.unwrap());
/// })
/// ```
#[derive(Clone, Debug)]
pub struct TcpProbe {
    host: Option<String>,
    port: u16,
    port_is_explicit: bool,
    timeout: Option<Duration>,
    data: Option<Vec<u8>>,
    service_check: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct TcpProbeBuilder {
    host: Option<String>,
    port: Option<u16>,
    timeout: Option<Duration>,
    data: Option<Vec<u8>>,
    service_check: Option<bool>,
}

impl TcpProbeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// Configuring a port explicitly implies `service_check` unless it is
    /// set explicitly too.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Data to send once the connection is up, at most [`MAX_DATA`] bytes.
    /// Configuring data implies `service_check` unless set explicitly.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Whether a refused connection fails the probe (checking an actual
    /// service) instead of counting as host reachability.
    pub fn with_service_check(mut self, service_check: bool) -> Self {
        self.service_check = Some(service_check);
        self
    }

    pub fn build(self) -> Result<TcpProbe> {
        if let Some(data) = &self.data {
            if data.len() > MAX_DATA {
                return Err(Error::DataTooLarge { max: MAX_DATA });
            }
        }
        Ok(TcpProbe {
            host: self.host,
            port: self.port.unwrap_or(DEFAULT_PORT),
            port_is_explicit: self.port.is_some(),
            timeout: Some(self.timeout.unwrap_or(DEFAULT_TIMEOUT)),
            data: self.data,
            service_check: self.service_check,
        })
    }
}

/// Call-time overrides; a set field wins over the instance configuration.
#[derive(Clone, Debug, Default)]
pub struct TcpOverrides {
    pub port: Option<u16>,
    pub timeout: Option<Duration>,
    pub data: Option<Vec<u8>>,
    pub service_check: Option<bool>,
}

impl TcpProbe {
    pub fn builder() -> TcpProbeBuilder {
        TcpProbeBuilder::new()
    }

    pub fn new(host: &str) -> Result<Self> {
        Self::builder().with_host(host).build()
    }
}

enum Exchange {
    Done(Option<Vec<u8>>),
    Refused,
    Failed(ProbeError),
}

#[async_trait]
impl Prober for TcpProbe {
    type Overrides = TcpOverrides;

    async fn probe_with(
        &self,
        host: Option<&str>,
        overrides: TcpOverrides,
    ) -> Result<ProbeOutcome> {
        let host = lifecycle::resolve_host(host, self.host.as_deref())?;
        let timeout = lifecycle::resolve_timeout(overrides.timeout, self.timeout)?;
        let port = overrides.port.unwrap_or(self.port);
        let data = match overrides.data {
            Some(data) => {
                if data.len() > MAX_DATA {
                    return Err(Error::DataTooLarge { max: MAX_DATA });
                }
                Some(data)
            }
            None => self.data.clone(),
        };
        let service_check = overrides
            .service_check
            .or(self.service_check)
            .unwrap_or_else(|| {
                overrides.port.is_some() || self.port_is_explicit || data.is_some()
            });

        let started = Instant::now();
        let deadline = started + timeout;

        // Failure here most likely means a bad host, so bail without
        // waiting out the deadline.
        let addr = match first_addr(host, port).await {
            Ok(addr) => addr,
            Err(err) => return Ok(ProbeOutcome::failed(err)),
        };

        let mut stream = match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) if is_refusal(&err) => {
                return Ok(refusal_outcome(service_check, started));
            }
            Ok(Err(err)) => return Ok(ProbeOutcome::failed(ProbeError::io(&err))),
            // Nothing came back from the connect wait; the quiet peer is
            // indistinguishable from a refusal here.
            Err(_) => return Ok(refusal_outcome(service_check, started)),
        };

        let exchange = match data.filter(|data| !data.is_empty()) {
            None => Exchange::Done(None),
            Some(data) => round_trip(&mut stream, &data, deadline).await,
        };

        let close_warning = match stream.shutdown().await {
            Ok(()) => None,
            Err(err) => Some(format!("socket close error: {err}")),
        };

        let mut outcome = match exchange {
            Exchange::Done(response) => {
                let mut outcome = ProbeOutcome::succeeded(started.elapsed());
                if let Some(bytes) = response {
                    outcome = outcome.with_response(ProbePayload::Bytes(bytes));
                }
                outcome
            }
            Exchange::Refused => refusal_outcome(service_check, started),
            Exchange::Failed(err) => ProbeOutcome::failed(err),
        };
        if let Some(warning) = close_warning {
            outcome = outcome.with_warning(warning);
        }
        Ok(outcome)
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

async fn round_trip(stream: &mut TcpStream, data: &[u8], deadline: Instant) -> Exchange {
    match timeout_at(deadline, stream.write_all(data)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) if is_refusal(&err) => return Exchange::Refused,
        Ok(Err(err)) => return Exchange::Failed(ProbeError::io(&err)),
        Err(_) => return Exchange::Refused,
    }
    let mut buf = vec![0u8; MAX_DATA];
    match timeout_at(deadline, stream.read(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Exchange::Done(Some(buf))
        }
        Ok(Err(err)) if is_refusal(&err) => Exchange::Refused,
        Ok(Err(err)) => Exchange::Failed(ProbeError::io(&err)),
        Err(_) => Exchange::Refused,
    }
}

fn is_refusal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

fn refusal_outcome(service_check: bool, started: Instant) -> ProbeOutcome {
    if service_check {
        ProbeOutcome::failed(ProbeError::Refused)
    } else {
        // Something answered with a refusal, so the host itself is there.
        ProbeOutcome::succeeded(started.elapsed())
    }
}
