use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::Lease;
use crate::config::LeaseConfig;
use crate::error::LeaseError;

/// Receives human-readable progress while waiting for a lease.
pub trait ProgressSink: Send + Sync {
    fn update(&self, status: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn update(&self, status: &str) {
        self(status)
    }
}

/// Forwards progress to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn update(&self, status: &str) {
        info!(status, "lease progress");
    }
}

/// Repeated acquisition with a fixed spacing between attempt starts.
#[derive(Debug, Clone, Copy)]
pub struct AcquireRetry {
    max_attempts: u32,
    retry_interval: Duration,
}

impl AcquireRetry {
    pub fn new(max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_interval,
        }
    }

    pub fn from_config(config: &LeaseConfig) -> Self {
        Self::new(config.lease_acquire_attempts, config.retry_interval())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Try to acquire `lease` up to `max_attempts` times.
    ///
    /// Returns the attempt number that succeeded. After the last failed attempt the
    /// error carries the attempt count and wraps the final failure.
    pub async fn acquire(
        &self,
        lease: &Lease,
        progress: &dyn ProgressSink,
    ) -> Result<u32, LeaseError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let err = match lease.acquire().await {
                Ok(()) => {
                    progress.update(&format!(
                        "lease acquired (attempt {attempt}/{})",
                        self.max_attempts
                    ));
                    return Ok(attempt);
                }
                Err(err) => err,
            };

            if attempt >= self.max_attempts {
                warn!(
                    lease = %format!("{}/{}", lease.namespace(), lease.name()),
                    attempts = attempt,
                    error = %err,
                    "giving up on lease acquisition"
                );
                progress.update(&format!(
                    "giving up on lease after {attempt} attempts: {err}"
                ));
                let current = err.current_holder().cloned();
                return Err(LeaseError::acquisition(
                    format!(
                        "failed to acquire lease {}/{}: max attempts reached ({attempt}/{})",
                        lease.namespace(),
                        lease.name(),
                        self.max_attempts
                    ),
                    lease.holder(),
                    current.as_ref(),
                    Some(Box::new(err)),
                ));
            }

            let wait = self.retry_interval.saturating_sub(started.elapsed());
            let held_by = err
                .current_holder()
                .map_or_else(|| err.to_string(), |holder| format!("held by {holder}"));
            progress.update(&format!(
                "lock exists ({held_by}), lease duration {}s, attempting again in {} seconds, attempt {attempt}/{}",
                lease.duration_seconds(),
                wait.as_secs(),
                self.max_attempts
            ));
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}
