//! # Remote-Call Gateway
//!
//! Every outbound call in the overlay goes through a [`Gateway`]. It bounds
//! each attempt by a fixed timeout and retries a bounded number of times;
//! transport faults and timeouts are swallowed and counted. When the retry
//! budget is exhausted the caller receives a [`RemoteUnavailable`] carrying
//! the retry count.
//!
//! ## Retry Policy
//!
//! | Policy | Attempts | Worst-case duration |
//! |--------|----------|---------------------|
//! | `Retries::Limited(n)` | `n + 1` | `timeout × (n + 1)` |
//! | `Retries::UntilDeadline(d)` | until `d` elapses | `d + timeout` |
//!
//! There is no "retry forever" mode: a caller that wants to keep trying
//! supplies a deadline.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::protocols::OverlayRpc;

/// Default per-attempt timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retries {
    /// Retry at most this many times after the first attempt.
    Limited(u32),
    /// Keep retrying until this much time has passed since the first attempt.
    UntilDeadline(Duration),
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Timeout applied to every single attempt.
    pub timeout: Duration,
    pub retries: Retries,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            retries: Retries::Limited(DEFAULT_MAX_RETRIES),
        }
    }
}

impl GatewayConfig {
    /// A zero timeout would fail every attempt before it starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.timeout.is_zero(), "gateway timeout must be positive");
        if let Retries::UntilDeadline(deadline) = self.retries {
            anyhow::ensure!(!deadline.is_zero(), "gateway retry deadline must be positive");
        }
        Ok(())
    }
}

/// A remote call failed on every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUnavailable {
    pub target: String,
    pub method: &'static str,
    /// Retries performed after the first attempt.
    pub retries: u32,
}

impl fmt::Display for RemoteUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} unavailable after {} retries",
            self.method, self.target, self.retries
        )
    }
}

impl std::error::Error for RemoteUnavailable {}

pub struct Gateway<N: OverlayRpc> {
    network: Arc<N>,
    config: GatewayConfig,
}

impl<N: OverlayRpc> Clone for Gateway<N> {
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            config: self.config.clone(),
        }
    }
}

impl<N: OverlayRpc> Gateway<N> {
    pub fn new(network: Arc<N>, config: GatewayConfig) -> Self {
        Self { network, config }
    }

    /// The underlying transport, for building the calls passed to [`Gateway::call`].
    pub fn network(&self) -> &N {
        &self.network
    }

    /// Run `op` against `target` under the gateway's timeout and retry policy.
    ///
    /// `op` is invoked once per attempt and must build a fresh future each time.
    pub async fn call<T, F, Fut>(
        &self,
        target: &str,
        method: &'static str,
        mut op: F,
    ) -> Result<T, RemoteUnavailable>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            match tokio::time::timeout(self.config.timeout, op()).await {
                Ok(Ok(value)) => {
                    trace!(peer = %target, method, retries, "remote call succeeded");
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    debug!(peer = %target, method, attempt = retries + 1, error = %e, "remote call failed");
                }
                Err(_) => {
                    debug!(
                        peer = %target,
                        method,
                        attempt = retries + 1,
                        timeout_ms = self.config.timeout.as_millis() as u64,
                        "remote call timed out"
                    );
                }
            }

            if !self.may_retry(retries, started) {
                return Err(RemoteUnavailable {
                    target: target.to_string(),
                    method,
                    retries,
                });
            }
            retries += 1;
        }
    }

    fn may_retry(&self, retries_so_far: u32, started: Instant) -> bool {
        match self.config.retries {
            Retries::Limited(max) => retries_so_far < max,
            Retries::UntilDeadline(deadline) => started.elapsed() < deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::identity::PeerIdentity;
    use crate::messages::{MessageId, Query, SearchStatus};

    /// Transport that is never called directly; `call` only needs the type.
    struct NoNetwork;

    #[async_trait]
    impl OverlayRpc for NoNetwork {
        async fn hello(&self, _: &str, _: &str) -> anyhow::Result<bool> { Err(anyhow!("unused")) }
        async fn ping(&self, _: &str, _: &PeerIdentity) -> anyhow::Result<bool> { Err(anyhow!("unused")) }
        async fn pong(&self, _: &str, _: &PeerIdentity) -> anyhow::Result<bool> { Err(anyhow!("unused")) }
        async fn who(&self, _: &str) -> anyhow::Result<PeerIdentity> { Err(anyhow!("unused")) }
        async fn plist(&self, _: &str) -> anyhow::Result<Vec<PeerIdentity>> { Err(anyhow!("unused")) }
        async fn nlist(&self, _: &str) -> anyhow::Result<Vec<PeerIdentity>> { Err(anyhow!("unused")) }
        async fn neighbour_request(&self, _: &str, _: &PeerIdentity) -> anyhow::Result<(bool, PeerIdentity)> {
            Err(anyhow!("unused"))
        }
        async fn find(&self, _: &str, _: &Query) -> anyhow::Result<bool> { Err(anyhow!("unused")) }
        async fn start_walk(&self, _: &str, _: &Query, _: u32) -> anyhow::Result<bool> { Err(anyhow!("unused")) }
        async fn walker_find(&self, _: &str, _: &Query, _: &[String]) -> anyhow::Result<bool> { Err(anyhow!("unused")) }
        async fn found(&self, _: &str, _: MessageId, _: &str) -> anyhow::Result<bool> { Err(anyhow!("unused")) }
        async fn has_found_file(&self, _: &str, _: MessageId) -> anyhow::Result<SearchStatus> { Err(anyhow!("unused")) }
        async fn search_messages(&self, _: &str, _: MessageId) -> anyhow::Result<u64> { Err(anyhow!("unused")) }
        async fn get(&self, _: &str, _: &str) -> anyhow::Result<String> { Err(anyhow!("unused")) }
    }

    fn gateway(timeout: Duration, retries: Retries) -> Gateway<NoNetwork> {
        Gateway::new(Arc::new(NoNetwork), GatewayConfig { timeout, retries })
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let gw = gateway(Duration::from_millis(100), Retries::Limited(3));
        let attempts = &AtomicU32::new(0);

        let result = gw
            .call("10.0.0.1:1", "who", || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(7u32)
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let gw = gateway(Duration::from_millis(100), Retries::Limited(3));
        let attempts = &AtomicU32::new(0);

        let result = gw
            .call("10.0.0.1:1", "ping", || async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(anyhow!("connection refused")) } else { Ok(true) }
            })
            .await;

        assert_eq!(result, Ok(true));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_remote_unavailable() {
        let gw = gateway(Duration::from_millis(100), Retries::Limited(2));
        let attempts = &AtomicU32::new(0);

        let result: Result<(), _> = gw
            .call("10.0.0.1:1", "find", || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("connection reset"))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.retries, 2);
        assert_eq!(err.method, "find");
        assert_eq!(err.target, "10.0.0.1:1");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("after 2 retries"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let gw = gateway(Duration::from_millis(50), Retries::Limited(1));
        let attempts = &AtomicU32::new(0);

        let started = tokio::time::Instant::now();
        let result: Result<(), _> = gw
            .call("10.0.0.1:1", "pong", || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn deadline_policy_stops_retrying() {
        let gw = gateway(
            Duration::from_millis(10),
            Retries::UntilDeadline(Duration::from_millis(100)),
        );
        let attempts = &AtomicU32::new(0);

        let result: Result<(), _> = gw
            .call("10.0.0.1:1", "get", || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(anyhow!("unreachable"))
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.retries >= 1);
        assert_eq!(attempts.load(Ordering::SeqCst), err.retries + 1);
    }
}
