use std::time::Duration;

use crate::error::ProbeError;

/// Protocol-dependent payload captured from the remote end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbePayload {
    /// Raw bytes, e.g. an ICMP reply datagram or an echoed UDP payload.
    Bytes(Vec<u8>),
    /// Text, e.g. an HTTP header block or the ping utility's stdout.
    Text(String),
}

impl ProbePayload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Bytes(_) => None,
            Self::Text(text) => Some(text),
        }
    }
}

/// The uniform outcome of a single probe attempt.
///
/// Exactly one of the two terminal states holds: success with a duration and
/// no error, or failure with an error and no duration. Both states may carry
/// a warning and a response payload; HTTP probes additionally record the
/// numeric status code of the last response they saw.
#[derive(Clone, Debug, Default)]
pub struct ProbeOutcome {
    success: bool,
    duration: Option<Duration>,
    error: Option<ProbeError>,
    warning: Option<String>,
    response: Option<ProbePayload>,
    status_code: Option<u16>,
}

impl ProbeOutcome {
    pub(crate) fn succeeded(duration: Duration) -> Self {
        Self {
            success: true,
            duration: Some(duration),
            ..Self::default()
        }
    }

    pub(crate) fn failed(error: ProbeError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub(crate) fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    pub(crate) fn with_response(mut self, response: ProbePayload) -> Self {
        self.response = Some(response);
        self
    }

    pub(crate) fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Whether the probed host answered within the deadline.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Wall-clock time the attempt took. Present only on success.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// What went wrong. Present only on failure.
    pub fn error(&self) -> Option<&ProbeError> {
        self.error.as_ref()
    }

    /// A caveat that did not change the terminal state, e.g. a followed
    /// redirect or an advisory line from the ping utility.
    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    /// Whatever the remote end sent back, in the strategy's native shape.
    pub fn response(&self) -> Option<&ProbePayload> {
        self.response.as_ref()
    }

    /// Numeric status code of the last HTTP response, success or not.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }
}

#[cfg(test)]
pub(crate) fn assert_terminal_invariant(outcome: &ProbeOutcome) {
    if outcome.success() {
        assert!(outcome.duration().is_some(), "success must carry a duration");
        assert!(outcome.error().is_none(), "success must not carry an error");
    } else {
        assert!(outcome.duration().is_none(), "failure must not carry a duration");
        assert!(outcome.error().is_some(), "failure must carry an error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeded_carries_duration_and_no_error() {
        let outcome = ProbeOutcome::succeeded(Duration::from_millis(3));
        assert!(outcome.success());
        assert_eq!(outcome.duration(), Some(Duration::from_millis(3)));
        assert!(outcome.error().is_none());
        assert!(outcome.warning().is_none());
        assert!(outcome.response().is_none());
        assert_terminal_invariant(&outcome);
    }

    #[test]
    fn failed_carries_error_and_no_duration() {
        let outcome = ProbeOutcome::failed(ProbeError::Timeout);
        assert!(!outcome.success());
        assert!(outcome.duration().is_none());
        assert_eq!(outcome.error(), Some(&ProbeError::Timeout));
        assert_terminal_invariant(&outcome);
    }

    #[test]
    fn warning_and_response_do_not_change_the_terminal_state() {
        let outcome = ProbeOutcome::succeeded(Duration::from_millis(1))
            .with_warning("close failed")
            .with_response(ProbePayload::Bytes(vec![1, 2, 3]));
        assert!(outcome.success());
        assert_eq!(outcome.warning(), Some("close failed"));
        assert_eq!(outcome.response().unwrap().as_bytes(), &[1, 2, 3]);
        assert_terminal_invariant(&outcome);
    }

    #[test]
    fn payload_text_accessor() {
        let text = ProbePayload::Text("HTTP/1.1 200 OK\n".to_string());
        assert_eq!(text.as_text(), Some("HTTP/1.1 200 OK\n"));
        assert!(ProbePayload::Bytes(vec![0xff]).as_text().is_none());
    }
}
