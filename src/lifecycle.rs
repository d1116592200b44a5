//! Shared per-attempt plumbing: host/timeout resolution and the
//! environment override that force-enables unavailable strategies.

use std::time::Duration;

use crate::error::{Error, Result};

/// Setting this variable to `all` lets unavailable strategies be
/// constructed anyway, for controlled testing.
pub(crate) const FORCE_ENV: &str = "ASYNC_PROBE_FORCE";

pub(crate) fn force_enabled() -> bool {
    std::env::var(FORCE_ENV).map(|v| v == "all").unwrap_or(false)
}

/// Gate a builder on the strategy's availability in this environment.
pub(crate) fn ensure_available(reason: Option<String>) -> Result<()> {
    match reason {
        None => Ok(()),
        Some(reason) if force_enabled() => {
            log::warn!("ignoring \"{reason}\" because {FORCE_ENV}=all");
            Ok(())
        }
        Some(reason) => Err(Error::NotSupported(reason)),
    }
}

/// Call-time host wins, else the instance default.
pub(crate) fn resolve_host<'a>(
    call: Option<&'a str>,
    instance: Option<&'a str>,
) -> Result<&'a str> {
    call.or(instance).ok_or(Error::MissingHost)
}

/// Call-time timeout wins, else the instance default. A probe with no
/// resolvable deadline, or a zero one, is caller misuse.
pub(crate) fn resolve_timeout(
    call: Option<Duration>,
    instance: Option<Duration>,
) -> Result<Duration> {
    let timeout = call.or(instance).ok_or(Error::MissingTimeout)?;
    if timeout.is_zero() {
        return Err(Error::ZeroTimeout);
    }
    Ok(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_time_host_wins_over_instance_default() {
        assert_eq!(resolve_host(Some("a"), Some("b")).unwrap(), "a");
        assert_eq!(resolve_host(None, Some("b")).unwrap(), "b");
    }

    #[test]
    fn missing_host_is_an_error() {
        assert!(matches!(resolve_host(None, None), Err(Error::MissingHost)));
    }

    #[test]
    fn call_time_timeout_wins_over_instance_default() {
        let resolved = resolve_timeout(
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(resolved, Duration::from_secs(1));
    }

    #[test]
    fn missing_or_zero_timeout_is_an_error() {
        assert!(matches!(
            resolve_timeout(None, None),
            Err(Error::MissingTimeout)
        ));
        assert!(matches!(
            resolve_timeout(Some(Duration::ZERO), Some(Duration::from_secs(5))),
            Err(Error::ZeroTimeout)
        ));
    }

    #[test]
    fn availability_gate_passes_available_strategies_through() {
        assert!(ensure_available(None).is_ok());
        assert!(matches!(
            ensure_available(Some("needs root".to_string())),
            Err(Error::NotSupported(reason)) if reason == "needs root"
        ));
    }
}
