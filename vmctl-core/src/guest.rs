//! Guest-OS configuration hook and its retry policy.
//!
//! Freshly booted guests usually refuse connections for a while, so
//! configuration runs under an explicit [`RetryPolicy`].

use crate::error::{Result, VmctlError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// Configures software inside a running guest (SSH, packages, ...).
#[async_trait]
pub trait GuestConfigurator: Send + Sync {
    async fn configure(&self, vm_name: &str) -> Result<()>;
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    ///
    /// Saturates at `max_backoff` for any attempt number.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Run the configurator for `vm_name` until it succeeds or attempts run out.
    ///
    /// Returns the number of attempts used.
    pub async fn configure(
        &self,
        configurator: &dyn GuestConfigurator,
        vm_name: &str,
    ) -> Result<u32> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match configurator.configure(vm_name).await {
                Ok(()) => {
                    info!(vm_name, attempt, "Guest configured");
                    return Ok(attempt);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(vm_name, attempt, max_attempts, error = %e, ?delay, "Guest configuration failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(VmctlError::GuestConfig {
                        vm_name: vm_name.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GuestConfigurator for Flaky {
        async fn configure(&self, vm_name: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(VmctlError::Internal(format!("{}: connection refused", vm_name)));
            }
            Ok(())
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_saturates_for_large_attempts() {
        let policy = RetryPolicy { max_attempts: 100, ..RetryPolicy::default() };
        assert_eq!(policy.backoff(70), Duration::from_secs(30));
        assert_eq!(policy.backoff(2_000), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let guest = Flaky { failures_left: AtomicU32::new(2), calls: AtomicU32::new(0) };
        let attempts = RetryPolicy::default().configure(&guest, "hadoop_1").await.unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(guest.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let guest = Flaky { failures_left: AtomicU32::new(10), calls: AtomicU32::new(0) };
        let policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
        let err = policy.configure(&guest, "hadoop_1").await.unwrap_err();
        match err {
            VmctlError::GuestConfig { vm_name, attempts, reason } => {
                assert_eq!(vm_name, "hadoop_1");
                assert_eq!(attempts, 3);
                assert!(reason.contains("connection refused"));
            }
            other => panic!("Expected GuestConfig error, got {}", other),
        }
        assert_eq!(guest.calls.load(Ordering::SeqCst), 3);
    }
}
