//! Reconnect backoff policy.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::supervisor::ShutdownToken;

/// Exponential backoff with a hard cap. Attempt 0 waits `base`, each
/// further consecutive failure doubles the wait up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(5));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Retry `connect` on the backoff schedule until it succeeds or
/// shutdown fires. Lets a worker start before its dependencies do.
pub async fn connect_with_retry<T, E, F, Fut>(
    name: &str,
    shutdown: &ShutdownToken,
    policy: ReconnectPolicy,
    mut connect: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    while !shutdown.is_triggered() {
        match connect().await {
            Ok(value) => {
                info!(dependency = name, "connected");
                return Some(value);
            }
            Err(e) => {
                warn!(dependency = name, error = %e, attempt, "connect failed, retrying");
                tokio::select! {
                    _ = shutdown.wait() => {}
                    _ = tokio::time::sleep(policy.delay_for(attempt)) => {}
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_up_to_cap() {
        let policy = ReconnectPolicy::new(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3), Duration::from_secs(30));
        assert_eq!(policy.delay_for(100), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_with_retry_eventually_succeeds() {
        let shutdown = ShutdownToken::new();
        let policy = ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(1));

        let mut attempts = 0u32;
        let result = connect_with_retry("dep", &shutdown, policy, || {
            attempts += 1;
            let ok = attempts >= 3;
            async move {
                if ok {
                    Ok(42u32)
                } else {
                    Err("not yet up")
                }
            }
        })
        .await;

        assert_eq!(result, Some(42));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_connect_with_retry_stops_on_shutdown() {
        let shutdown = ShutdownToken::new();
        shutdown.trigger();
        let policy = ReconnectPolicy::new(Duration::from_millis(1), Duration::from_millis(1));

        let result: Option<u32> =
            connect_with_retry("dep", &shutdown, policy, || async { Err("down") }).await;
        assert_eq!(result, None);
    }

    #[test]
    fn test_small_base() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
    }
}
