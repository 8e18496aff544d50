//! Runtime configuration of the controller

use std::time::Duration;

/// Default number of reconcile workers
const DEFAULT_WORKERS: usize = 2;

/// Default deadline for one reconcile cycle
const DEFAULT_CYCLE_TIMEOUT_SECONDS: u64 = 30;

/// Default interval between full resyncs
const DEFAULT_RESYNC_SECONDS: u64 = 300; // 5 minutes

/// Exponential backoff for transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: u32,
    /// Upper bound on any delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            multiplier: 2,
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based):
    /// `initial * multiplier^(attempt - 1)`, capped at `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Deadline for one reconcile cycle
    pub cycle_timeout: Duration,
    /// Interval between full resyncs of every ConsumerAutoscaler
    pub resync_interval: Duration,
    /// Retry policy for transient failures
    pub backoff: BackoffPolicy,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            cycle_timeout: Duration::from_secs(DEFAULT_CYCLE_TIMEOUT_SECONDS),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_SECONDS),
            backoff: BackoffPolicy::default(),
        }
    }
}
