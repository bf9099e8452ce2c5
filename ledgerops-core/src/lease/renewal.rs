//! Background renewal of held leases.
//!
//! The scheduler keeps a registry of one tokio task per scheduled lease. Each task
//! ticks at half the lease duration and calls [`Renewable::try_renew`]; a failed
//! renewal is dropped and retried on the next tick. Tasks only keep a weak
//! reference to their lease, so a forgotten lease cannot be kept alive by its timer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// The narrow contract the scheduler needs from a lease.
#[async_trait]
pub trait Renewable: Send + Sync {
    /// Lease duration used to derive the renewal period.
    fn duration_seconds(&self) -> u64;

    /// Human-readable key for logs, e.g. `namespace/name`.
    fn describe(&self) -> String;

    /// Renew once; must never fail loudly.
    async fn try_renew(&self) -> bool;
}

/// Opaque handle for a scheduled renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleId(Uuid);

impl ScheduleId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Renewal period for a lease of `duration_seconds`: exactly half the duration.
pub fn renewal_delay(duration_seconds: u64) -> Duration {
    Duration::from_millis(duration_seconds.saturating_mul(500))
}

struct ScheduledRenewal {
    target: Weak<dyn Renewable>,
    handle: JoinHandle<()>,
}

/// Process-wide renewal service.
///
/// Construct one per process, share it (it is cheap to clone) with every lease, and
/// call [`RenewalScheduler::shutdown`] before exiting.
#[derive(Clone, Default)]
pub struct RenewalScheduler {
    inner: Arc<RwLock<HashMap<ScheduleId, ScheduledRenewal>>>,
}

impl RenewalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start renewing `target` every [`renewal_delay`] and return its handle.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip_all, fields(lease = %target.describe()))]
    pub fn schedule(&self, target: Arc<dyn Renewable>) -> ScheduleId {
        let id = ScheduleId::new();
        let period = renewal_delay(target.duration_seconds());
        let weak = Arc::downgrade(&target);
        let handle = tokio::spawn(renewal_loop(id, Weak::clone(&weak), period));

        let mut registry = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.insert(
            id,
            ScheduledRenewal {
                target: weak,
                handle,
            },
        );
        info!(
            schedule_id = %id,
            period_ms = period.as_millis() as u64,
            scheduled = registry.len(),
            "lease renewal scheduled"
        );
        id
    }

    pub fn is_scheduled(&self, id: ScheduleId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&id)
    }

    /// Number of outstanding schedules.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop renewing. Returns whether `id` was registered.
    ///
    /// Once this returns the renewal task has finished: an in-flight renewal has
    /// either completed or been dropped, and no further renewal will start.
    pub async fn cancel(&self, id: ScheduleId) -> bool {
        let Some(entry) = self.remove(id) else {
            return false;
        };
        entry.handle.abort();
        if let Err(err) = entry.handle.await {
            if err.is_panic() {
                warn!(schedule_id = %id, error = %err, "lease renewal task panicked");
            }
        }
        debug!(schedule_id = %id, "lease renewal cancelled");
        true
    }

    /// Cancel every outstanding schedule.
    pub async fn cancel_all(&self) -> HashMap<ScheduleId, bool> {
        let ids: Vec<ScheduleId> = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect();
        let mut results = HashMap::with_capacity(ids.len());
        for id in ids {
            results.insert(id, self.cancel(id).await);
        }
        results
    }

    /// Cancel everything at process exit.
    pub async fn shutdown(&self) {
        let cancelled = self.cancel_all().await;
        if !cancelled.is_empty() {
            info!(cancelled = cancelled.len(), "lease renewal scheduler shut down");
        }
    }

    /// Abort a schedule without waiting for the task, for use from `Drop`.
    pub(crate) fn detach(&self, id: ScheduleId) {
        if let Some(entry) = self.remove(id) {
            entry.handle.abort();
            debug!(schedule_id = %id, "lease renewal detached");
        }
    }

    /// Leases whose schedules are still registered and alive.
    pub fn scheduled_leases(&self) -> Vec<(ScheduleId, String)> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter_map(|(id, entry)| entry.target.upgrade().map(|t| (*id, t.describe())))
            .collect()
    }

    fn remove(&self, id: ScheduleId) -> Option<ScheduledRenewal> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
    }
}

async fn renewal_loop(id: ScheduleId, target: Weak<dyn Renewable>, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the lease was just written.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(lease) = target.upgrade() else {
            debug!(schedule_id = %id, "lease dropped, stopping renewal");
            return;
        };
        if lease.try_renew().await {
            debug!(schedule_id = %id, lease = %lease.describe(), "lease renewed");
        } else {
            warn!(
                schedule_id = %id,
                lease = %lease.describe(),
                "background lease renewal failed, retrying on next tick"
            );
        }
    }
}
