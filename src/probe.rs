use async_trait::async_trait;

use crate::error::Result;
use crate::lifecycle;
use crate::outcome::ProbeOutcome;

/// A single reachability-probing strategy.
///
/// One call to [`probe_with`](Prober::probe_with) performs exactly one
/// bounded attempt: it allocates its own socket, subprocess or HTTP client,
/// releases it before returning on every path, and reports a fresh
/// [`ProbeOutcome`]. Instances are immutable after construction and may be
/// shared across sequential or concurrent calls; probing the same targets
/// in parallel observes the same per-host outcomes as probing them one by
/// one.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Call-time overrides for this strategy. Every field is optional; a
    /// set field wins over the instance configuration, which wins over the
    /// documented default.
    type Overrides: Default + Send + 'static;

    /// Why this strategy cannot run in the current environment, if it
    /// cannot (insufficient privilege, unsupported platform).
    fn not_available_reason() -> Option<String>
    where
        Self: Sized,
    {
        None
    }

    /// Whether this strategy can run here at all. `ASYNC_PROBE_FORCE=all`
    /// in the environment force-enables an unavailable strategy.
    fn available() -> bool
    where
        Self: Sized,
    {
        lifecycle::force_enabled() || Self::not_available_reason().is_none()
    }

    /// Probe `host` (falling back to the instance default host) with the
    /// given overrides applied on top of the instance configuration.
    ///
    /// # Errors
    /// Only for caller misuse: no host or timeout resolvable, or override
    /// data past the strategy's maximum. Reachability failures are captured
    /// inside the returned outcome.
    async fn probe_with(
        &self,
        host: Option<&str>,
        overrides: Self::Overrides,
    ) -> Result<ProbeOutcome>;

    /// Probe the instance's default host with no overrides.
    async fn probe(&self) -> Result<ProbeOutcome> {
        self.probe_with(None, Self::Overrides::default()).await
    }

    /// Probe `host` with no overrides.
    async fn probe_host(&self, host: &str) -> Result<ProbeOutcome> {
        self.probe_with(Some(host), Self::Overrides::default()).await
    }

    /// Boolean convenience over [`probe`](Prober::probe). Configuration
    /// errors still surface as `Err`.
    async fn is_alive(&self) -> Result<bool> {
        Ok(self.probe().await?.success())
    }

    /// Boolean convenience over [`probe_with`](Prober::probe_with).
    async fn is_alive_with(
        &self,
        host: Option<&str>,
        overrides: Self::Overrides,
    ) -> Result<bool> {
        Ok(self.probe_with(host, overrides).await?.success())
    }
}
