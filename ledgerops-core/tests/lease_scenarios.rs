use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use ledgerops_core::lease::{ProcessProbe, ProcessStatus};
use ledgerops_core::{
    AcquireRetry, HolderIdentity, Lease, LeaseConfig, LeaseManager, LeaseRecord, LeaseState,
    LeaseStore, MemoryLeaseStore, RenewalScheduler, StoreError, TracingProgress,
};

fn h1() -> HolderIdentity {
    HolderIdentity::new("alice", "build-01", 4242)
}

fn h2() -> HolderIdentity {
    HolderIdentity::new("bob", "build-02", 5151)
}

fn probe(status: ProcessStatus) -> Arc<dyn ProcessProbe> {
    Arc::new(move |_pid: u32| status)
}

fn lease(store: &Arc<MemoryLeaseStore>, holder: HolderIdentity) -> Lease {
    Lease::builder(store.clone(), RenewalScheduler::new(), "ns1")
        .holder(holder)
        .duration_seconds(20)
        .probe(probe(ProcessStatus::Running))
        .build()
}

fn seeded_record(holder: &HolderIdentity, idle: TimeDelta) -> LeaseRecord {
    let acquired = Utc::now() - idle - TimeDelta::seconds(5);
    LeaseRecord {
        name: "ns1".into(),
        namespace: "ns1".into(),
        holder_identity: holder.to_wire(),
        duration_seconds: 20,
        acquire_time: acquired,
        renew_time: Some(Utc::now() - idle),
        transitions: 0,
        resource_version: 3,
    }
}

fn stored(store: &MemoryLeaseStore) -> Result<LeaseRecord> {
    store
        .get("ns1", "ns1")
        .ok_or_else(|| anyhow!("lease record ns1/ns1 is missing"))
}

#[tokio::test]
async fn acquire_on_empty_store_creates_record() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    let lease = lease(&store, h1());

    lease.acquire().await?;

    let record = stored(&store)?;
    assert_eq!(HolderIdentity::from_wire(&record.holder_identity)?, h1());
    assert_eq!(record.transitions, 0);
    assert_eq!(record.duration_seconds, 20);
    assert!(lease.is_acquired().await?);
    assert!(!lease.is_expired().await?);

    lease.release().await?;
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test]
async fn second_holder_is_refused_with_current_holder() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    let first = lease(&store, h1());
    first.acquire().await?;

    let second = lease(&store, h2());
    let err = second
        .acquire()
        .await
        .err()
        .ok_or_else(|| anyhow!("second holder must not acquire a live lease"))?;
    assert!(err.is_acquisition());
    assert_eq!(err.current_holder(), Some(&h1()));
    assert_eq!(err.holder(), Some(&h2()));
    assert!(!second.try_acquire().await);
    assert!(!second.is_acquired().await?);

    first.release().await?;
    Ok(())
}

#[tokio::test]
async fn reacquire_by_holder_only_touches_timestamps() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    let lease = lease(&store, h1());
    lease.acquire().await?;
    let before = stored(&store)?;

    lease.acquire().await?;
    let after = stored(&store)?;
    assert_eq!(after.holder_identity, before.holder_identity);
    assert_eq!(after.transitions, before.transitions);
    assert_eq!(after.acquire_time, before.acquire_time);
    assert!(after.renew_time.is_some());

    lease.release().await?;
    Ok(())
}

#[tokio::test]
async fn expired_record_is_acquirable_by_anyone() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    store.insert(seeded_record(&h1(), TimeDelta::seconds(25)));

    let lease = lease(&store, h2());
    assert!(lease.is_expired().await?);
    assert!(matches!(lease.state().await?, LeaseState::Expired(_)));

    lease.acquire().await?;
    let record = stored(&store)?;
    assert_eq!(HolderIdentity::from_wire(&record.holder_identity)?, h2());
    assert_eq!(record.transitions, 1);
    assert!(!lease.is_expired().await?);
    assert!(lease.is_acquired().await?);

    lease.release().await?;
    Ok(())
}

#[tokio::test]
async fn own_expired_record_is_renewed_not_transferred() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    store.insert(seeded_record(&h1(), TimeDelta::seconds(25)));

    let lease = lease(&store, h1());
    lease.acquire().await?;
    assert_eq!(stored(&store)?.transitions, 0);
    lease.release().await?;
    Ok(())
}

#[tokio::test]
async fn stale_same_machine_holder_is_transferred() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    let dead = HolderIdentity::new("alice", "build-01", 1111);
    store.insert(seeded_record(&dead, TimeDelta::seconds(2)));

    let lease = Lease::builder(store.clone(), RenewalScheduler::new(), "ns1")
        .holder(h1())
        .probe(probe(ProcessStatus::Absent))
        .build();
    assert!(matches!(
        lease.state().await?,
        LeaseState::HeldByOtherStaleSameMachine { .. }
    ));

    lease.acquire().await?;
    let record = stored(&store)?;
    assert_eq!(record.transitions, 1);
    assert_eq!(HolderIdentity::from_wire(&record.holder_identity)?, h1());
    lease.release().await?;
    Ok(())
}

#[tokio::test]
async fn live_holder_on_another_machine_is_never_transferred() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    store.insert(seeded_record(&h2(), TimeDelta::seconds(2)));

    // Even a probe reporting "absent" must not matter across machines.
    let lease = Lease::builder(store.clone(), RenewalScheduler::new(), "ns1")
        .holder(h1())
        .probe(probe(ProcessStatus::Absent))
        .build();
    assert!(!lease.try_acquire().await);
    assert_eq!(stored(&store)?.transitions, 0);
    Ok(())
}

#[tokio::test]
async fn release_without_record_succeeds() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    let lease = lease(&store, h1());
    lease.release().await?;
    assert!(lease.try_release().await);
    Ok(())
}

#[tokio::test]
async fn release_of_someone_elses_lease_is_refused() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    store.insert(seeded_record(&h2(), TimeDelta::seconds(2)));

    let lease = lease(&store, h1());
    let err = lease
        .release()
        .await
        .err()
        .ok_or_else(|| anyhow!("releasing a foreign lease must fail"))?;
    assert!(err.is_relinquishment());
    assert_eq!(err.current_holder(), Some(&h2()));
    assert!(store.get("ns1", "ns1").is_some());
    Ok(())
}

#[tokio::test]
async fn namespaces_are_independent() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    let manager = LeaseManager::new(store.clone(), RenewalScheduler::new(), LeaseConfig::default())
        .with_holder(h1());
    let other = LeaseManager::new(store.clone(), RenewalScheduler::new(), LeaseConfig::default())
        .with_holder(h2());

    let a = manager.create("ns1");
    let b = other.create("ns2");
    a.acquire().await?;
    b.acquire().await?;
    assert_eq!(store.len(), 2);

    a.release().await?;
    b.release().await?;
    Ok(())
}

/// Answers every read with a snapshot, then lets a rival write first.
struct RacingStore {
    inner: MemoryLeaseStore,
    rival: String,
}

#[async_trait]
impl LeaseStore for RacingStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let snapshot = self.inner.read(namespace, name).await?;
        if snapshot.is_none() {
            self.inner.create(namespace, name, &self.rival, 20).await?;
        }
        Ok(snapshot)
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder_identity: &str,
        duration_seconds: u64,
    ) -> Result<LeaseRecord, StoreError> {
        self.inner
            .create(namespace, name, holder_identity, duration_seconds)
            .await
    }

    async fn renew(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
        self.inner.renew(record).await
    }

    async fn transfer(
        &self,
        record: &LeaseRecord,
        holder_identity: &str,
    ) -> Result<LeaseRecord, StoreError> {
        self.inner.transfer(record, holder_identity).await
    }

    async fn delete(&self, record: &LeaseRecord) -> Result<(), StoreError> {
        self.inner.delete(record).await
    }
}

#[tokio::test]
async fn losing_a_create_race_is_an_acquisition_error() -> Result<()> {
    let store = Arc::new(RacingStore {
        inner: MemoryLeaseStore::new(),
        rival: h2().to_wire(),
    });
    let lease = Lease::builder(store.clone(), RenewalScheduler::new(), "ns1")
        .holder(h1())
        .build();

    let err = lease
        .acquire()
        .await
        .err()
        .ok_or_else(|| anyhow!("the racing create must lose"))?;
    assert!(err.is_acquisition());
    assert!(lease.schedule_id().is_none());
    let record = store
        .inner
        .get("ns1", "ns1")
        .ok_or_else(|| anyhow!("rival record missing"))?;
    assert_eq!(HolderIdentity::from_wire(&record.holder_identity)?, h2());
    Ok(())
}

/// Counts acquisition attempts through reads.
#[derive(Default)]
struct CountingStore {
    inner: MemoryLeaseStore,
    reads: AtomicUsize,
}

#[async_trait]
impl LeaseStore for CountingStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(namespace, name).await
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder_identity: &str,
        duration_seconds: u64,
    ) -> Result<LeaseRecord, StoreError> {
        self.inner
            .create(namespace, name, holder_identity, duration_seconds)
            .await
    }

    async fn renew(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
        self.inner.renew(record).await
    }

    async fn transfer(
        &self,
        record: &LeaseRecord,
        holder_identity: &str,
    ) -> Result<LeaseRecord, StoreError> {
        self.inner.transfer(record, holder_identity).await
    }

    async fn delete(&self, record: &LeaseRecord) -> Result<(), StoreError> {
        self.inner.delete(record).await
    }
}

#[tokio::test(start_paused = true)]
async fn retry_makes_exactly_max_attempts_against_a_contested_lease() -> Result<()> {
    let store = Arc::new(CountingStore::default());
    store.inner.insert(seeded_record(&h2(), TimeDelta::zero()));

    let lease = Lease::builder(store.clone(), RenewalScheduler::new(), "ns1")
        .holder(h1())
        .build();
    let err = AcquireRetry::new(3, Duration::from_secs(20))
        .acquire(&lease, &TracingProgress)
        .await
        .err()
        .ok_or_else(|| anyhow!("a contested lease must exhaust the retries"))?;

    assert_eq!(store.reads.load(Ordering::SeqCst), 3);
    assert!(err.is_acquisition());
    assert!(err.to_string().contains("(3/3)"), "{err}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn held_lease_is_kept_alive_past_its_duration() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    let scheduler = RenewalScheduler::new();
    let lease = Lease::builder(store.clone(), scheduler.clone(), "ns1")
        .holder(h1())
        .duration_seconds(2)
        .build();
    lease.acquire().await?;
    let version = stored(&store)?.resource_version;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let record = stored(&store)?;
    assert!(record.resource_version >= version + 3);

    lease.release().await?;
    assert!(scheduler.is_empty());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test]
async fn release_deletes_an_expired_foreign_record() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    store.insert(seeded_record(&h2(), TimeDelta::seconds(25)));

    let lease = lease(&store, h1());
    lease.release().await?;
    assert!(store.is_empty());
    Ok(())
}

/// Hands every record it reads to a rival before the caller can write.
struct TakeoverStore {
    inner: MemoryLeaseStore,
    rival: String,
}

#[async_trait]
impl LeaseStore for TakeoverStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let snapshot = self.inner.read(namespace, name).await?;
        if let Some(record) = &snapshot {
            self.inner.transfer(record, &self.rival).await?;
        }
        Ok(snapshot)
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder_identity: &str,
        duration_seconds: u64,
    ) -> Result<LeaseRecord, StoreError> {
        self.inner
            .create(namespace, name, holder_identity, duration_seconds)
            .await
    }

    async fn renew(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
        self.inner.renew(record).await
    }

    async fn transfer(
        &self,
        record: &LeaseRecord,
        holder_identity: &str,
    ) -> Result<LeaseRecord, StoreError> {
        self.inner.transfer(record, holder_identity).await
    }

    async fn delete(&self, record: &LeaseRecord) -> Result<(), StoreError> {
        self.inner.delete(record).await
    }
}

#[tokio::test]
async fn release_never_deletes_a_record_taken_over_meanwhile() -> Result<()> {
    let rival = HolderIdentity::new("carol", "build-03", 777);
    let store = Arc::new(TakeoverStore {
        inner: MemoryLeaseStore::new(),
        rival: rival.to_wire(),
    });
    store
        .inner
        .insert(seeded_record(&h2(), TimeDelta::seconds(25)));

    let lease = Lease::builder(store.clone(), RenewalScheduler::new(), "ns1")
        .holder(h1())
        .build();
    let err = lease
        .release()
        .await
        .err()
        .ok_or_else(|| anyhow!("release must not delete the rival's fresh lease"))?;
    assert!(err.is_relinquishment());

    let record = store
        .inner
        .get("ns1", "ns1")
        .ok_or_else(|| anyhow!("rival lease was deleted"))?;
    assert_eq!(HolderIdentity::from_wire(&record.holder_identity)?, rival);
    assert_eq!(record.transitions, 1);
    Ok(())
}

/// Memory store whose backend can be switched off.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryLeaseStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow!("connection refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for FlakyStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        self.check()?;
        self.inner.read(namespace, name).await
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder_identity: &str,
        duration_seconds: u64,
    ) -> Result<LeaseRecord, StoreError> {
        self.check()?;
        self.inner
            .create(namespace, name, holder_identity, duration_seconds)
            .await
    }

    async fn renew(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
        self.check()?;
        self.inner.renew(record).await
    }

    async fn transfer(
        &self,
        record: &LeaseRecord,
        holder_identity: &str,
    ) -> Result<LeaseRecord, StoreError> {
        self.check()?;
        self.inner.transfer(record, holder_identity).await
    }

    async fn delete(&self, record: &LeaseRecord) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(record).await
    }
}

#[tokio::test]
async fn unreachable_store_on_release_leaves_record_to_expire() -> Result<()> {
    let store = Arc::new(FlakyStore::default());
    let lease = Lease::builder(store.clone(), RenewalScheduler::new(), "ns1")
        .holder(h1())
        .build();
    lease.acquire().await?;
    store.down.store(true, Ordering::SeqCst);

    let err = lease
        .release()
        .await
        .err()
        .ok_or_else(|| anyhow!("release must report the store failure"))?;
    assert!(err.is_relinquishment());
    assert!(std::error::Error::source(&err).is_some());
    assert!(lease.schedule_id().is_none());
    assert!(!lease.try_release().await);

    let record = store
        .inner
        .get("ns1", "ns1")
        .ok_or_else(|| anyhow!("record should be left in place"))?;
    assert_eq!(HolderIdentity::from_wire(&record.holder_identity)?, h1());

    store.down.store(false, Ordering::SeqCst);
    assert!(lease.try_release().await);
    assert!(store.inner.is_empty());
    Ok(())
}

#[tokio::test]
async fn try_release_reports_a_foreign_lease_as_false() -> Result<()> {
    let store = Arc::new(MemoryLeaseStore::new());
    store.insert(seeded_record(&h2(), TimeDelta::seconds(2)));

    let lease = lease(&store, h1());
    assert!(!lease.try_release().await);
    assert!(store.get("ns1", "ns1").is_some());
    Ok(())
}

/// Memory store whose clock runs `behind` the test process clock.
struct SkewedClockStore {
    inner: MemoryLeaseStore,
    behind: TimeDelta,
}

#[async_trait]
impl LeaseStore for SkewedClockStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        self.inner.read(namespace, name).await
    }

    async fn observe(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(Option<LeaseRecord>, DateTime<Utc>), StoreError> {
        let record = self.inner.read(namespace, name).await?;
        Ok((record, Utc::now() - self.behind))
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder_identity: &str,
        duration_seconds: u64,
    ) -> Result<LeaseRecord, StoreError> {
        self.inner
            .create(namespace, name, holder_identity, duration_seconds)
            .await
    }

    async fn renew(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
        self.inner.renew(record).await
    }

    async fn transfer(
        &self,
        record: &LeaseRecord,
        holder_identity: &str,
    ) -> Result<LeaseRecord, StoreError> {
        self.inner.transfer(record, holder_identity).await
    }

    async fn delete(&self, record: &LeaseRecord) -> Result<(), StoreError> {
        self.inner.delete(record).await
    }
}

#[tokio::test]
async fn expiry_is_judged_by_the_store_clock() -> Result<()> {
    // Renewed 31s ago by this process's clock, but only 1s ago by the store's.
    let store = Arc::new(SkewedClockStore {
        inner: MemoryLeaseStore::new(),
        behind: TimeDelta::seconds(30),
    });
    store
        .inner
        .insert(seeded_record(&h2(), TimeDelta::seconds(31)));

    let lease = Lease::builder(store.clone(), RenewalScheduler::new(), "ns1")
        .holder(h1())
        .build();
    assert!(!lease.is_expired().await?);
    assert!(matches!(
        lease.state().await?,
        LeaseState::HeldByOtherLive { .. }
    ));

    let err = lease
        .acquire()
        .await
        .err()
        .ok_or_else(|| anyhow!("a live lease must not be taken over"))?;
    assert_eq!(err.current_holder(), Some(&h2()));
    assert!(!lease.try_release().await);

    let record = store
        .inner
        .get("ns1", "ns1")
        .ok_or_else(|| anyhow!("live lease missing"))?;
    assert_eq!(HolderIdentity::from_wire(&record.holder_identity)?, h2());
    assert_eq!(record.transitions, 0);
    Ok(())
}
