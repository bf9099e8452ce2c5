use std::sync::Arc;

use tracing::debug;

use super::{AcquireRetry, HolderIdentity, Lease, ProcessProbe, RenewalScheduler, SystemProbe};
use crate::config::LeaseConfig;
use crate::store::LeaseStore;

/// Factory for [`Lease`] handles sharing one store, scheduler and holder identity.
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    scheduler: RenewalScheduler,
    config: LeaseConfig,
    holder: HolderIdentity,
    probe: Arc<dyn ProcessProbe>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, scheduler: RenewalScheduler, config: LeaseConfig) -> Self {
        Self {
            store,
            scheduler,
            config,
            holder: HolderIdentity::current(),
            probe: Arc::new(SystemProbe),
        }
    }

    pub fn with_holder(mut self, holder: HolderIdentity) -> Self {
        self.holder = holder;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn holder(&self) -> &HolderIdentity {
        &self.holder
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &RenewalScheduler {
        &self.scheduler
    }

    /// Lease named after its namespace.
    pub fn create(&self, namespace: &str) -> Lease {
        self.create_named(namespace, namespace)
    }

    pub fn create_named(&self, namespace: &str, name: &str) -> Lease {
        debug!(namespace, name, holder = %self.holder, "creating lease handle");
        Lease::builder(self.store.clone(), self.scheduler.clone(), namespace)
            .name(name)
            .holder(self.holder.clone())
            .duration_seconds(self.config.lease_duration_seconds)
            .probe(self.probe.clone())
            .build()
    }

    /// Retry policy from the configured attempts and interval.
    pub fn retry(&self) -> AcquireRetry {
        AcquireRetry::from_config(&self.config)
    }
}
