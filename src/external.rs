use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{timeout, Instant};

use crate::error::{ProbeError, Result};
use crate::lifecycle;
use crate::outcome::{ProbeOutcome, ProbePayload};
use crate::probe::Prober;

const PING_PROGRAM: &str = "ping";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Diagnostic phrases the ping utility prints on stdout when it fails
/// without writing anything to stderr.
const FAILURE_PHRASES: [&str; 4] = [
    "timed out",
    "could not find host",
    "packet loss",
    "unknown host",
];

/// Probes a host by spawning the platform's native `ping` utility with
/// one-echo semantics.
///
/// The utility's own timeout flag is passed where the platform has one, but
/// the caller's deadline is enforced independently: if the subprocess is
/// still running when it passes, the child is killed and the outcome is a
/// failure with the error `execution expired`. Otherwise the exit status is
/// authoritative.
#[derive(Clone, Debug)]
pub struct ExternalProbe {
    host: Option<String>,
    timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct ExternalProbeBuilder {
    host: Option<String>,
    timeout: Option<Duration>,
}

impl ExternalProbeBuilder {
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

    pub fn build(self) -> Result<ExternalProbe> {
        Ok(ExternalProbe {
            host: self.host,
            timeout: Some(self.timeout.unwrap_or(DEFAULT_TIMEOUT)),
        })
    }
}

/// Call-time overrides; a set field wins over the instance configuration.
#[derive(Clone, Debug, Default)]
pub struct ExternalOverrides {
    pub timeout: Option<Duration>,
}

impl ExternalProbe {
    pub fn builder() -> ExternalProbeBuilder {
        ExternalProbeBuilder::new()
    }

    pub fn new(host: &str) -> Result<Self> {
        Self::builder().with_host(host).build()
    }
}

#[async_trait]
impl Prober for ExternalProbe {
    type Overrides = ExternalOverrides;

    async fn probe_with(
        &self,
        host: Option<&str>,
        overrides: ExternalOverrides,
    ) -> Result<ProbeOutcome> {
        let host = lifecycle::resolve_host(host, self.host.as_deref())?;
        let limit = lifecycle::resolve_timeout(overrides.timeout, self.timeout)?;

        let args = ping_args(host, limit);
        log::debug!("spawning {PING_PROGRAM} {}", args.join(" "));

        let started = Instant::now();
        let child = Command::new(PING_PROGRAM)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => return Ok(ProbeOutcome::failed(ProbeError::io(&err))),
        };

        // Dropping the unfinished wait kills the child, so the utility's
        // own timeout flag never gets to stretch the caller's deadline.
        let output = match timeout(limit, child.wait_with_output()).await {
            Err(_) => return Ok(ProbeOutcome::failed(ProbeError::Expired)),
            Ok(Err(err)) => return Ok(ProbeOutcome::failed(ProbeError::io(&err))),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr_line = String::from_utf8_lossy(&output.stderr)
            .lines()
            .next()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.is_empty());

        let (mut outcome, warning) = if output.status.success() {
            let warning = stderr_line.filter(|line| is_warning(line));
            (ProbeOutcome::succeeded(started.elapsed()), warning)
        } else {
            let (error, warning) = diagnose(stderr_line, &stdout, &output.status);
            (ProbeOutcome::failed(error), warning)
        };
        if let Some(warning) = warning {
            outcome = outcome.with_warning(warning);
        }
        if !stdout.is_empty() {
            outcome = outcome.with_response(ProbePayload::Text(stdout));
        }
        Ok(outcome)
    }
}

/// One-echo argument vector for the platform's ping. Timeout units and flag
/// spellings vary; unrecognized platforms get a plain invocation and rely
/// on the supervising deadline alone.
fn ping_args(host: &str, timeout: Duration) -> Vec<String> {
    let secs = timeout.as_secs().max(1).to_string();
    let host = host.to_string();
    if cfg!(target_os = "linux") {
        vec!["-c".into(), "1".into(), "-W".into(), secs, host]
    } else if cfg!(target_os = "aix") {
        vec!["-c".into(), "1".into(), "-w".into(), secs, host]
    } else if cfg!(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )) {
        vec!["-c".into(), "1".into(), "-t".into(), secs, host]
    } else if cfg!(any(target_os = "solaris", target_os = "illumos")) {
        vec![host, secs]
    } else if cfg!(windows) {
        let millis = timeout.as_millis().max(1).to_string();
        vec!["-n".into(), "1".into(), "-w".into(), millis, host]
    } else {
        vec![host]
    }
}

fn is_warning(line: &str) -> bool {
    line.to_ascii_lowercase().contains("warning")
}

/// Turn a failed run's output into a diagnostic: stderr is authoritative
/// when present, otherwise stdout is scanned for recognizable phrases.
fn diagnose(
    stderr_line: Option<String>,
    stdout: &str,
    status: &std::process::ExitStatus,
) -> (ProbeError, Option<String>) {
    if let Some(line) = stderr_line {
        let warning = is_warning(&line).then(|| line.clone());
        return (ProbeError::Diagnostic(line), warning);
    }

    let mut warning = None;
    for line in stdout.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.contains("warning") {
            warning = Some(line.trim().to_string());
        }
        if FAILURE_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
            return (ProbeError::Diagnostic(line.trim().to_string()), warning);
        }
    }
    (
        ProbeError::Diagnostic(format!("ping failed with {status}")),
        warning,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::assert_terminal_invariant;

    #[test]
    fn the_argument_vector_always_names_the_host() {
        let args = ping_args("192.0.2.10", Duration::from_secs(3));
        assert!(args.contains(&"192.0.2.10".to_string()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_gets_one_echo_and_a_seconds_timeout() {
        let args = ping_args("localhost", Duration::from_secs(2));
        assert_eq!(args, vec!["-c", "1", "-W", "2", "localhost"]);
    }

    #[test]
    fn subsecond_timeouts_round_up_to_one_second() {
        let args = ping_args("localhost", Duration::from_millis(250));
        assert!(args.contains(&"1".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn stderr_is_the_preferred_diagnostic() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(256);

        let (error, warning) = diagnose(
            Some("ping: cannot resolve nowhere: Unknown host".to_string()),
            "",
            &status,
        );
        assert_eq!(
            error,
            ProbeError::Diagnostic("ping: cannot resolve nowhere: Unknown host".to_string())
        );
        assert!(warning.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn a_warning_line_on_stderr_is_both_diagnostic_and_warning() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(256);

        let line = "WARNING: probing a broadcast address".to_string();
        let (error, warning) = diagnose(Some(line.clone()), "", &status);
        assert_eq!(error, ProbeError::Diagnostic(line.clone()));
        assert_eq!(warning, Some(line));
    }

    #[cfg(unix)]
    #[test]
    fn stdout_is_scanned_for_recognizable_phrases() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(256);

        let stdout = "PING 192.0.2.1 (192.0.2.1): 56 data bytes\n\
                      Request timed out.\n";
        let (error, warning) = diagnose(None, stdout, &status);
        assert_eq!(error, ProbeError::Diagnostic("Request timed out.".to_string()));
        assert!(warning.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn quiet_failures_still_get_a_diagnostic() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(256);

        let (error, _) = diagnose(None, "", &status);
        assert!(matches!(error, ProbeError::Diagnostic(_)));
    }

    // The remaining tests spawn the real utility; environments without one
    // (or without permission to use it) skip rather than fail.

    async fn utility_present() -> bool {
        Command::new(PING_PROGRAM)
            .arg("-c")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|mut child| {
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                true
            })
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn a_loopback_ping_reports_a_terminal_outcome() {
        if !utility_present().await {
            return;
        }
        let probe = ExternalProbe::new("127.0.0.1").unwrap();
        let outcome = probe.probe().await.unwrap();
        assert_terminal_invariant(&outcome);
        if outcome.success() {
            assert!(outcome.response().is_some());
        }
    }

    #[tokio::test]
    async fn the_deadline_is_enforced_on_a_silent_target() {
        if !utility_present().await {
            return;
        }
        let probe = ExternalProbe::new("192.0.2.1").unwrap();
        let started = std::time::Instant::now();
        let outcome = probe
            .probe_with(
                None,
                ExternalOverrides {
                    timeout: Some(Duration::from_secs(1)),
                },
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(2500));
        assert_terminal_invariant(&outcome);
    }
}
