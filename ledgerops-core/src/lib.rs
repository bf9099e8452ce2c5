//! Cross-invocation lease locking for ledger operations tooling.
//!
//! Independent invocations coordinate through lease records kept in a shared
//! store: acquire a [`Lease`] before a critical section, let the
//! [`RenewalScheduler`] keep it alive, and release it when done.

pub mod config;
pub mod error;
pub mod lease;
pub mod store;

pub use config::LeaseConfig;
pub use error::{LeaseError, StoreError};
pub use lease::{
    AcquireRetry, HolderIdentity, Lease, LeaseManager, LeaseState, ProgressSink,
    RenewalScheduler, TracingProgress,
};
pub use store::{LeaseRecord, LeaseStore, MemoryLeaseStore};
