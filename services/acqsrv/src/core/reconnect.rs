//! Reconnection helper with exponential backoff and jitter
//!
//! Transport failures retry 250 ms -> 8 s for five attempts, then drop to
//! long idle probes. Auth failures never reach this helper; the manager
//! surfaces them as `error` status directly.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{AcqError, Result};

/// Backoff policy for one connection
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts before falling back to idle probes
    pub fast_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between fast attempts
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
    /// Interval for idle probes after the fast attempts are exhausted
    pub idle_probe_interval: Duration,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            fast_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            idle_probe_interval: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_reconnects: u64,
    pub failed_reconnects: u64,
    pub last_connected: Option<Instant>,
}

/// Backoff state machine shared by every driver
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    current_attempt: u32,
    stats: ReconnectStats,
    /// Set during deliberate shutdown to suppress reconnect log noise
    closing: bool,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current_attempt: 0,
            stats: ReconnectStats::default(),
            closing: false,
        }
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    /// Mark the helper as closing; subsequent failures log at debug only
    pub fn set_closing(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Reset after a successful connect
    pub fn mark_connected(&mut self) {
        self.current_attempt = 0;
        self.stats.last_connected = Some(Instant::now());
    }

    /// Delay before the next attempt
    ///
    /// Fast attempts back off exponentially from the initial delay; once
    /// exhausted, every further attempt waits the idle probe interval.
    pub fn next_delay(&self) -> Duration {
        let mut delay = if self.current_attempt >= self.policy.fast_attempts {
            self.policy.idle_probe_interval
        } else {
            let attempt = self.current_attempt.saturating_sub(1);
            let raw = self
                .policy
                .initial_delay
                .mul_f64(self.policy.backoff_multiplier.powi(attempt as i32));
            raw.min(self.policy.max_delay)
        };

        if self.policy.jitter {
            // ±25% of delay
            let jitter_range = delay.as_millis() as f64 * 0.25;
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
            delay = Duration::from_millis(delay_ms as u64);
        }
        delay
    }

    /// Execute one reconnection attempt, sleeping the backoff delay first
    /// (except on the very first attempt)
    pub async fn execute_reconnect<F, Fut>(&mut self, mut connect_fn: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.current_attempt += 1;
        self.stats.total_attempts += 1;

        if self.current_attempt > 1 {
            let delay = self.next_delay();
            debug!("Reconnect attempt {} in {:?}", self.current_attempt, delay);
            tokio::time::sleep(delay).await;
        }

        let start = Instant::now();
        match connect_fn().await {
            Ok(()) => {
                info!(
                    "Reconnected after {:?} (attempt {})",
                    start.elapsed(),
                    self.current_attempt
                );
                self.mark_connected();
                self.stats.successful_reconnects += 1;
                Ok(())
            },
            Err(e) => {
                self.stats.failed_reconnects += 1;
                if self.closing {
                    debug!("Connect attempt during shutdown: {}", e);
                    return Err(AcqError::cancelled("closing"));
                }
                if self.current_attempt == self.policy.fast_attempts {
                    warn!(
                        "Connect failed {} times, falling back to idle probes: {}",
                        self.current_attempt, e
                    );
                } else {
                    debug!("Connect attempt {} failed: {}", self.current_attempt, e);
                }
                Err(e)
            },
        }
    }

    /// True once fast attempts are exhausted (status should show error)
    pub fn exhausted_fast_attempts(&self) -> bool {
        self.current_attempt >= self.policy.fast_attempts
    }
}
