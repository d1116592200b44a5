use thiserror::Error as ThisError;

/// Errors for caller misuse or an unavailable strategy.
///
/// Reachability failures are never reported through this type; they are
/// captured as a [`ProbeError`] inside the returned
/// [`ProbeOutcome`](crate::ProbeOutcome).
#[derive(ThisError, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("no host specified")]
    MissingHost,
    #[error("no timeout specified and no default is set")]
    MissingTimeout,
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("cannot set data larger than {max} bytes")]
    DataTooLarge { max: usize },
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A reachability failure captured inside a
/// [`ProbeOutcome`](crate::ProbeOutcome).
#[derive(ThisError, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProbeError {
    /// The deadline passed without a definitive reply.
    #[error("timeout")]
    Timeout,
    /// The ping utility was still running when the deadline passed.
    #[error("execution expired")]
    Expired,
    /// The remote end refused or reset the connection.
    #[error("connection refused")]
    Refused,
    /// The redirect chain grew past the configured limit.
    #[error("Redirect limit exceeded")]
    RedirectLimitExceeded,
    /// An echo reply arrived but did not carry the payload that was sent.
    #[error("echoed data did not match the data sent")]
    DataMismatch,
    /// Host or address resolution failed.
    #[error("{0}")]
    Resolution(String),
    /// An HTTP response that fails the probe: a non-success terminal
    /// status, or a redirect that cannot be followed.
    #[error("{0}")]
    Status(String),
    /// A diagnostic line scanned from the ping utility's output.
    #[error("{0}")]
    Diagnostic(String),
    /// A transport-level I/O failure.
    #[error("{0}")]
    Io(String),
}

impl ProbeError {
    pub(crate) fn io(err: &std::io::Error) -> Self {
        Self::Io(err.to_string())
    }

    pub(crate) fn resolution(err: &std::io::Error) -> Self {
        Self::Resolution(err.to_string())
    }
}
