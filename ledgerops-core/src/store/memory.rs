use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use super::{LeaseRecord, LeaseStore};
use crate::error::StoreError;

type RecordKey = (String, String);

/// Process-local lease store.
///
/// Useful for tests and single-host runs; applies the same version checks as the
/// networked stores.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    records: RwLock<HashMap<RecordKey, LeaseRecord>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a record as-is.
    pub fn insert(&self, record: LeaseRecord) {
        let key = (record.namespace.clone(), record.name.clone());
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, record);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<LeaseRecord> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<F>(&self, record: &LeaseRecord, apply: F) -> Result<LeaseRecord, StoreError>
    where
        F: FnOnce(&mut LeaseRecord),
    {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stored = records
            .get_mut(&key(&record.namespace, &record.name))
            .filter(|stored| stored.resource_version == record.resource_version)
            .ok_or_else(|| StoreError::conflict(&record.namespace, &record.name))?;
        apply(stored);
        stored.resource_version += 1;
        Ok(stored.clone())
    }
}

fn key(namespace: &str, name: &str) -> RecordKey {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(self.get(namespace, name))
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder_identity: &str,
        duration_seconds: u64,
    ) -> Result<LeaseRecord, StoreError> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = key(namespace, name);
        if records.contains_key(&key) {
            return Err(StoreError::conflict(namespace, name));
        }
        let record = LeaseRecord {
            name: name.to_string(),
            namespace: namespace.to_string(),
            holder_identity: holder_identity.to_string(),
            duration_seconds,
            acquire_time: Utc::now(),
            renew_time: None,
            transitions: 0,
            resource_version: 1,
        };
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn renew(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
        self.update(record, |stored| stored.renew_time = Some(Utc::now()))
    }

    async fn transfer(
        &self,
        record: &LeaseRecord,
        holder_identity: &str,
    ) -> Result<LeaseRecord, StoreError> {
        self.update(record, |stored| {
            stored.holder_identity = holder_identity.to_string();
            stored.renew_time = Some(Utc::now());
            stored.transitions += 1;
        })
    }

    async fn delete(&self, record: &LeaseRecord) -> Result<(), StoreError> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = key(&record.namespace, &record.name);
        match records.get(&key) {
            None => Ok(()),
            Some(stored) if stored.resource_version == record.resource_version => {
                records.remove(&key);
                Ok(())
            }
            Some(_) => Err(StoreError::conflict(&record.namespace, &record.name)),
        }
    }
}
