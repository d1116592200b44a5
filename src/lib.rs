//! Async reachability probing over ICMP, TCP, UDP, HTTP, or the system
//! `ping` utility.
//!
//! Every strategy performs exactly one timeout-bounded probe attempt per
//! call and reports a uniform [`ProbeOutcome`]: a success flag, the elapsed
//! duration on success, a captured [`ProbeError`] on failure, an optional
//! warning, and an optional protocol-dependent response payload (plus the
//! numeric status code for HTTP). Reachability failures never surface as
//! `Err`; only caller misuse (missing host or timeout, oversized payload
//! data, an unavailable strategy) does.
//!
//! ## Example
//! ```no_run
//! use async_probe::{Prober, TcpProbe};
//!
//! tokio_test::block_on(async {
//!     let probe = TcpProbe::builder()
//!         .with_host("example.com")
//!         .with_port(443)
//!         .build()
//!         .unwrap();
//!
//!     let outcome = probe.probe().await.unwrap();
//!     if outcome.success() {
//!         println!("reachable in {:?}", outcome.duration().unwrap());
//!     } else {
//!         println!("unreachable: {}", outcome.error().unwrap());
//!     }
//! })
//! ```
//! Strategies that need special privileges or platform support (raw-socket
//! ICMP) expose a class-level availability query so callers can skip them
//! gracefully; see [`Prober::available`].

pub mod error;
pub mod external;
pub mod http;
pub mod icmp;
pub mod outcome;
pub mod probe;
pub mod tcp;
pub mod udp;

pub(crate) mod lifecycle;

pub use error::{Error, ProbeError, Result};
pub use external::{ExternalOverrides, ExternalProbe, ExternalProbeBuilder};
pub use http::{HttpOverrides, HttpProbe, HttpProbeBuilder};
pub use icmp::{IcmpOverrides, IcmpProbe, IcmpProbeBuilder};
pub use outcome::{ProbeOutcome, ProbePayload};
pub use probe::Prober;
pub use tcp::{TcpOverrides, TcpProbe, TcpProbeBuilder};
pub use udp::{UdpOverrides, UdpProbe, UdpProbeBuilder};
