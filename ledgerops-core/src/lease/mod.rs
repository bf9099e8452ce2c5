//! Lease-based mutual exclusion across CLI invocations.
//!
//! A [`Lease`] guards one logical critical section (typically a namespace) by
//! owning a record in a shared [`LeaseStore`]. Only one holder identity may own a
//! live record; a record is up for grabs once it expires, or earlier when its holder
//! is a dead process on the caller's own machine.
//!
//! Every operation re-reads the record from the store. Writes following a read are
//! conditional on the record version, so the store resolves racing acquirers and
//! the loser sees [`LeaseError::Acquisition`].

mod holder;
mod manager;
mod renewal;
mod retry;

pub use holder::{HolderIdentity, ProcessProbe, ProcessStatus, SystemProbe};
pub use manager::LeaseManager;
pub use renewal::{renewal_delay, RenewalScheduler, Renewable, ScheduleId};
pub use retry::{AcquireRetry, ProgressSink, TracingProgress};

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::{LeaseError, StoreError};
use crate::store::{LeaseRecord, LeaseStore};

/// Default lease duration in seconds.
pub const DEFAULT_LEASE_DURATION_SECONDS: u64 = 20;

/// Where a lease record stands relative to a given holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    /// No record exists.
    Unclaimed,
    /// Live record owned by this holder.
    HeldByMe(LeaseRecord),
    /// Record older than its duration, whoever holds it.
    Expired(LeaseRecord),
    /// Live record owned by someone else.
    HeldByOtherLive {
        record: LeaseRecord,
        holder: HolderIdentity,
    },
    /// Live record owned by a dead process of the same user on this machine.
    HeldByOtherStaleSameMachine {
        record: LeaseRecord,
        holder: HolderIdentity,
    },
}

impl LeaseState {
    pub fn record(&self) -> Option<&LeaseRecord> {
        match self {
            Self::Unclaimed => None,
            Self::HeldByMe(record) | Self::Expired(record) => Some(record),
            Self::HeldByOtherLive { record, .. }
            | Self::HeldByOtherStaleSameMachine { record, .. } => Some(record),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unclaimed => "unclaimed",
            Self::HeldByMe(_) => "held-by-me",
            Self::Expired(_) => "expired",
            Self::HeldByOtherLive { .. } => "held-by-other",
            Self::HeldByOtherStaleSameMachine { .. } => "held-by-other-stale",
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// State shared between a [`Lease`] handle and its renewal task.
struct LeaseCore {
    store: Arc<dyn LeaseStore>,
    holder: HolderIdentity,
    holder_wire: String,
    namespace: String,
    name: String,
    duration_seconds: u64,
    probe: Arc<dyn ProcessProbe>,
}

impl LeaseCore {
    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn is_mine(&self, record: &LeaseRecord) -> bool {
        record.holder_identity == self.holder_wire
            || HolderIdentity::from_wire(&record.holder_identity)
                .is_ok_and(|holder| holder == self.holder)
    }

    fn classify(
        &self,
        record: Option<LeaseRecord>,
        now: DateTime<Utc>,
    ) -> Result<LeaseState, LeaseError> {
        let Some(record) = record else {
            return Ok(LeaseState::Unclaimed);
        };
        if record.is_expired_at(now) {
            return Ok(LeaseState::Expired(record));
        }
        if self.is_mine(&record) {
            return Ok(LeaseState::HeldByMe(record));
        }
        let holder = HolderIdentity::from_wire(&record.holder_identity)?;
        if holder.is_same_machine_identity(&self.holder)
            && !holder.is_process_alive_with(self.probe.as_ref())
        {
            return Ok(LeaseState::HeldByOtherStaleSameMachine { record, holder });
        }
        Ok(LeaseState::HeldByOtherLive { record, holder })
    }

    fn acquisition_error(
        &self,
        message: impl Into<String>,
        current: Option<&HolderIdentity>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> LeaseError {
        LeaseError::acquisition(message, &self.holder, current, source)
    }

    fn store_acquisition_error(&self, action: &str, err: StoreError) -> LeaseError {
        let message = if err.is_conflict() {
            format!("lease {} was claimed concurrently while {action}", self.key())
        } else {
            format!("failed {action} lease {}", self.key())
        };
        self.acquisition_error(message, None, Some(Box::new(err)))
    }

    async fn read(&self) -> Result<Option<LeaseRecord>, StoreError> {
        self.store.read(&self.namespace, &self.name).await
    }

    /// Record plus the store's current time, for expiry decisions.
    async fn observe(&self) -> Result<(Option<LeaseRecord>, DateTime<Utc>), StoreError> {
        self.store.observe(&self.namespace, &self.name).await
    }

    async fn create(&self) -> Result<LeaseRecord, LeaseError> {
        self.store
            .create(
                &self.namespace,
                &self.name,
                &self.holder_wire,
                self.duration_seconds,
            )
            .await
            .map_err(|err| self.store_acquisition_error("creating", err))
    }

    async fn renew_record(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
        self.store
            .renew(record)
            .await
            .map_err(|err| self.store_acquisition_error("renewing", err))
    }

    async fn transfer_record(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
        self.store
            .transfer(record, &self.holder_wire)
            .await
            .map_err(|err| self.store_acquisition_error("transferring", err))
    }

    /// Refresh a record held by this holder, creating it if absent.
    async fn renew(&self) -> Result<LeaseRecord, LeaseError> {
        let record = self
            .read()
            .await
            .map_err(|err| self.store_acquisition_error("reading", err))?;
        match record {
            None => self.create().await,
            Some(record) if self.is_mine(&record) => self.renew_record(&record).await,
            Some(record) => {
                let current = HolderIdentity::from_wire(&record.holder_identity).ok();
                Err(self.acquisition_error(
                    format!(
                        "cannot renew lease {}: held by {}",
                        self.key(),
                        current
                            .as_ref()
                            .map_or_else(|| record.holder_identity.clone(), |h| h.to_string())
                    ),
                    current.as_ref(),
                    None,
                ))
            }
        }
    }
}

#[async_trait]
impl Renewable for LeaseCore {
    fn duration_seconds(&self) -> u64 {
        self.duration_seconds
    }

    fn describe(&self) -> String {
        self.key()
    }

    async fn try_renew(&self) -> bool {
        match self.renew().await {
            Ok(_) => true,
            Err(err) => {
                debug!(lease = %self.key(), error = %err, "lease renewal attempt failed");
                false
            }
        }
    }
}

/// Handle on one named lease in one namespace.
///
/// Create it with [`LeaseManager::create`] (or [`Lease::builder`]), call
/// [`Lease::acquire`] before the critical section and [`Lease::release`] after it.
/// While acquired the lease is renewed in the background at half its duration.
pub struct Lease {
    core: Arc<LeaseCore>,
    scheduler: RenewalScheduler,
    schedule_id: Mutex<Option<ScheduleId>>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("namespace", &self.core.namespace)
            .field("name", &self.core.name)
            .field("holder", &self.core.holder)
            .field("duration_seconds", &self.core.duration_seconds)
            .field("schedule_id", &self.schedule_id())
            .finish()
    }
}

impl Lease {
    pub fn builder(
        store: Arc<dyn LeaseStore>,
        scheduler: RenewalScheduler,
        namespace: impl Into<String>,
    ) -> LeaseBuilder {
        LeaseBuilder {
            store,
            scheduler,
            namespace: namespace.into(),
            name: None,
            holder: None,
            duration_seconds: DEFAULT_LEASE_DURATION_SECONDS,
            probe: None,
        }
    }

    pub fn holder(&self) -> &HolderIdentity {
        &self.core.holder
    }

    pub fn namespace(&self) -> &str {
        &self.core.namespace
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn duration_seconds(&self) -> u64 {
        self.core.duration_seconds
    }

    /// Handle of the background renewal, if one is scheduled.
    pub fn schedule_id(&self) -> Option<ScheduleId> {
        *self
            .schedule_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read the record and classify it relative to this lease's holder, judging
    /// expiry by the store's clock.
    pub async fn state(&self) -> Result<LeaseState, LeaseError> {
        let (record, now) = self
            .core
            .observe()
            .await
            .map_err(|err| self.core.store_acquisition_error("reading", err))?;
        self.core.classify(record, now)
    }

    /// Claim the lease for this holder, or fail if another live holder owns it.
    ///
    /// On success a background renewal is scheduled if none is running yet.
    #[instrument(skip(self), fields(lease = %self.core.key(), holder = %self.core.holder))]
    pub async fn acquire(&self) -> Result<(), LeaseError> {
        let state = self.state().await.map_err(|err| match err {
            LeaseError::MalformedHolder { .. } => self.core.acquisition_error(
                format!("lease {} has an unreadable holder", self.core.key()),
                None,
                Some(Box::new(err)),
            ),
            other => other,
        })?;

        match state {
            LeaseState::Unclaimed => {
                self.core.create().await?;
                info!("lease created");
            }
            LeaseState::HeldByMe(record) => {
                self.core.renew_record(&record).await?;
                debug!("lease already held, renewed");
            }
            LeaseState::Expired(record) if self.core.is_mine(&record) => {
                self.core.renew_record(&record).await?;
                info!("own expired lease renewed");
            }
            LeaseState::Expired(record) => {
                let previous = record.holder_identity.clone();
                let updated = self.core.transfer_record(&record).await?;
                info!(
                    previous_holder = %previous,
                    transitions = updated.transitions,
                    "expired lease taken over"
                );
            }
            LeaseState::HeldByOtherStaleSameMachine { record, holder } => {
                let updated = self.core.transfer_record(&record).await?;
                info!(
                    previous_holder = %holder,
                    transitions = updated.transitions,
                    "stale lease of dead local process transferred"
                );
            }
            LeaseState::HeldByOtherLive { holder, .. } => {
                debug!(current_holder = %holder, "lease held by another live holder");
                return Err(self.core.acquisition_error(
                    format!(
                        "lease {} is already held by {holder}; requested by {}",
                        self.core.key(),
                        self.core.holder
                    ),
                    Some(&holder),
                    None,
                ));
            }
        }

        self.ensure_renewal_scheduled();
        Ok(())
    }

    /// [`Self::acquire`] reporting only success.
    pub async fn try_acquire(&self) -> bool {
        match self.acquire().await {
            Ok(()) => true,
            Err(err) => {
                debug!(lease = %self.core.key(), error = %err, "try_acquire failed");
                false
            }
        }
    }

    /// Refresh the lease if this holder owns it (creating it when absent).
    ///
    /// Unlike [`Self::acquire`] this never takes over a stale or expired record.
    #[instrument(skip(self), fields(lease = %self.core.key()))]
    pub async fn renew(&self) -> Result<(), LeaseError> {
        self.core.renew().await.map(|_| ())
    }

    pub async fn try_renew(&self) -> bool {
        self.core.try_renew().await
    }

    /// Stop renewing and delete the record.
    ///
    /// Renewal is cancelled first and awaited, so no background renewal can recreate
    /// the record afterwards. If the store cannot be reached the record is left in
    /// place and expires on its own.
    #[instrument(skip(self), fields(lease = %self.core.key(), holder = %self.core.holder))]
    pub async fn release(&self) -> Result<(), LeaseError> {
        let scheduled = self
            .schedule_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(id) = scheduled {
            self.scheduler.cancel(id).await;
        }

        let holder = &self.core.holder;
        let (record, now) = self.core.observe().await.map_err(|err| {
            warn!(error = %err, "lease store unavailable during release, record left to expire");
            LeaseError::relinquishment(
                format!("failed reading lease {} during release", self.core.key()),
                holder,
                None,
                Some(Box::new(err)),
            )
        })?;

        let Some(record) = record else {
            debug!("no lease record to release");
            return Ok(());
        };

        if self.core.is_mine(&record) || record.is_expired_at(now) {
            self.core.store.delete(&record).await.map_err(|err| {
                let message = if err.is_conflict() {
                    warn!("lease changed hands during release, leaving it in place");
                    format!("lease {} changed hands during release", self.core.key())
                } else {
                    warn!(error = %err, "failed to delete lease record, record left to expire");
                    format!("failed deleting lease {}", self.core.key())
                };
                LeaseError::relinquishment(message, holder, None, Some(Box::new(err)))
            })?;
            info!("lease released");
            return Ok(());
        }

        let current = HolderIdentity::from_wire(&record.holder_identity).ok();
        warn!(
            current_holder = %record.holder_identity,
            "lease is held by another holder at release"
        );
        Err(LeaseError::relinquishment(
            format!(
                "cannot release lease {}: held by {}",
                self.core.key(),
                current
                    .as_ref()
                    .map_or_else(|| record.holder_identity.clone(), |h| h.to_string())
            ),
            holder,
            current.as_ref(),
            None,
        ))
    }

    pub async fn try_release(&self) -> bool {
        match self.release().await {
            Ok(()) => true,
            Err(err) => {
                warn!(lease = %self.core.key(), error = %err, "try_release failed");
                false
            }
        }
    }

    /// Whether a live record held by this holder exists.
    pub async fn is_acquired(&self) -> Result<bool, LeaseError> {
        Ok(matches!(self.state().await?, LeaseState::HeldByMe(_)))
    }

    /// Whether an expired record exists, whoever holds it.
    pub async fn is_expired(&self) -> Result<bool, LeaseError> {
        let (record, now) = self
            .core
            .observe()
            .await
            .map_err(|err| self.core.store_acquisition_error("reading", err))?;
        Ok(record.is_some_and(|record| record.is_expired_at(now)))
    }

    fn ensure_renewal_scheduled(&self) {
        let mut scheduled = self
            .schedule_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(id) = *scheduled {
            if self.scheduler.is_scheduled(id) {
                return;
            }
        }
        let target: Arc<dyn Renewable> = self.core.clone();
        *scheduled = Some(self.scheduler.schedule(target));
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let scheduled = self
            .schedule_id
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(id) = scheduled {
            self.scheduler.detach(id);
        }
    }
}

/// Builder for [`Lease`].
pub struct LeaseBuilder {
    store: Arc<dyn LeaseStore>,
    scheduler: RenewalScheduler,
    namespace: String,
    name: Option<String>,
    holder: Option<HolderIdentity>,
    duration_seconds: u64,
    probe: Option<Arc<dyn ProcessProbe>>,
}

impl LeaseBuilder {
    /// Record name; defaults to the namespace.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Holder identity; defaults to [`HolderIdentity::current`].
    pub fn holder(mut self, holder: HolderIdentity) -> Self {
        self.holder = Some(holder);
        self
    }

    /// Lease duration; zero is bumped to one second.
    pub fn duration_seconds(mut self, duration_seconds: u64) -> Self {
        self.duration_seconds = duration_seconds.max(1);
        self
    }

    /// Liveness probe for stale-holder detection; defaults to [`SystemProbe`].
    pub fn probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> Lease {
        let holder = self.holder.unwrap_or_else(HolderIdentity::current);
        let name = self.name.unwrap_or_else(|| self.namespace.clone());
        Lease {
            core: Arc::new(LeaseCore {
                store: self.store,
                holder_wire: holder.to_wire(),
                holder,
                namespace: self.namespace,
                name,
                duration_seconds: self.duration_seconds,
                probe: self.probe.unwrap_or_else(|| Arc::new(SystemProbe)),
            }),
            scheduler: self.scheduler,
            schedule_id: Mutex::new(None),
        }
    }
}
