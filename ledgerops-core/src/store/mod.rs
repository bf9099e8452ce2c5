//! Lease record storage.
//!
//! The lease subsystem never talks to a database directly; it reads and writes
//! [`LeaseRecord`]s through a [`LeaseStore`]. Every write that follows a read is
//! conditional on the record's `resource_version`, so two invocations racing on the
//! same record cannot both win: the loser gets [`StoreError::Conflict`].

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryLeaseStore;
#[cfg(feature = "postgres")]
pub use postgres::{PgSslMode, PostgresLeaseStore};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A lease as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub name: String,
    pub namespace: String,
    /// Serialized [`crate::lease::HolderIdentity`].
    pub holder_identity: String,
    pub duration_seconds: u64,
    pub acquire_time: DateTime<Utc>,
    /// Set on the first renewal or transfer.
    pub renew_time: Option<DateTime<Utc>>,
    pub transitions: u64,
    /// Optimistic-concurrency token, bumped on every write.
    pub resource_version: u64,
}

impl LeaseRecord {
    /// Most recent of acquire and renew time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        match self.renew_time {
            Some(renewed) => renewed.max(self.acquire_time),
            None => self.acquire_time,
        }
    }

    /// Expiry is judged with the duration stored on the record, which may differ
    /// from the duration of the lease handle reading it.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let duration = i64::try_from(self.duration_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.last_activity()) > duration
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// CRUD contract over namespaced lease records.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, StoreError>;

    /// Read the record together with the current time of the clock that stamps
    /// `acquire_time` and `renew_time`. Expiry must be judged against this time,
    /// never against the caller's own clock.
    ///
    /// Stores stamping records with `Utc::now()` can rely on the default.
    async fn observe(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(Option<LeaseRecord>, DateTime<Utc>), StoreError> {
        let record = self.read(namespace, name).await?;
        Ok((record, Utc::now()))
    }

    /// Create a record. Fails with [`StoreError::Conflict`] if one already exists.
    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder_identity: &str,
        duration_seconds: u64,
    ) -> Result<LeaseRecord, StoreError>;

    /// Refresh the renew time of the previously read `record`.
    async fn renew(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError>;

    /// Hand the previously read `record` to a new holder, bumping `transitions`.
    async fn transfer(
        &self,
        record: &LeaseRecord,
        holder_identity: &str,
    ) -> Result<LeaseRecord, StoreError>;

    /// Delete the previously read `record`. Fails with [`StoreError::Conflict`] if it
    /// was changed since; deleting an already absent record succeeds.
    async fn delete(&self, record: &LeaseRecord) -> Result<(), StoreError>;
}
