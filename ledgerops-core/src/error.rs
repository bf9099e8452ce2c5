use thiserror::Error;

use crate::lease::HolderIdentity;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the lease operations.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The lease could not be acquired or renewed: another live holder owns it,
    /// or the record store failed while trying.
    #[error("{message}")]
    Acquisition {
        message: String,
        holder: Box<HolderIdentity>,
        current_holder: Option<Box<HolderIdentity>>,
        #[source]
        source: Option<BoxError>,
    },
    /// The lease could not be released because someone else holds it, or the
    /// record store failed during release.
    #[error("{message}")]
    Relinquishment {
        message: String,
        holder: Box<HolderIdentity>,
        current_holder: Option<Box<HolderIdentity>>,
        #[source]
        source: Option<BoxError>,
    },
    /// A holder identity read from a lease record could not be decoded.
    #[error("malformed lease holder identity {input:?}: {source}")]
    MalformedHolder {
        input: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LeaseError {
    pub(crate) fn acquisition(
        message: impl Into<String>,
        holder: &HolderIdentity,
        current_holder: Option<&HolderIdentity>,
        source: Option<BoxError>,
    ) -> Self {
        Self::Acquisition {
            message: message.into(),
            holder: Box::new(holder.clone()),
            current_holder: current_holder.map(|h| Box::new(h.clone())),
            source,
        }
    }

    pub(crate) fn relinquishment(
        message: impl Into<String>,
        holder: &HolderIdentity,
        current_holder: Option<&HolderIdentity>,
        source: Option<BoxError>,
    ) -> Self {
        Self::Relinquishment {
            message: message.into(),
            holder: Box::new(holder.clone()),
            current_holder: current_holder.map(|h| Box::new(h.clone())),
            source,
        }
    }

    /// Identity of the holder that owned the record when the error was raised.
    pub fn current_holder(&self) -> Option<&HolderIdentity> {
        match self {
            Self::Acquisition { current_holder, .. }
            | Self::Relinquishment { current_holder, .. } => current_holder.as_deref(),
            Self::MalformedHolder { .. } => None,
        }
    }

    /// Identity of the caller that attempted the operation.
    pub fn holder(&self) -> Option<&HolderIdentity> {
        match self {
            Self::Acquisition { holder, .. } | Self::Relinquishment { holder, .. } => {
                Some(holder.as_ref())
            }
            Self::MalformedHolder { .. } => None,
        }
    }

    pub fn is_acquisition(&self) -> bool {
        matches!(self, Self::Acquisition { .. })
    }

    pub fn is_relinquishment(&self) -> bool {
        matches!(self, Self::Relinquishment { .. })
    }
}

/// Errors returned by a [`crate::store::LeaseStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record changed (or appeared) between the caller's read and its write.
    #[error("lease record {namespace}/{name} was modified concurrently")]
    Conflict { namespace: String, name: String },
    #[error("lease store error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub(crate) fn conflict(namespace: &str, name: &str) -> Self {
        Self::Conflict {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
