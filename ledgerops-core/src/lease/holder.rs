//! Identity of a lease holder.
//!
//! A holder is the `(username, hostname, pid)` triple of the CLI invocation that
//! claims a lease. It is stored in the lease record as a JSON string so any
//! process reading the record can decode it, including processes on other hosts.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LeaseError;

/// Identity of the entity holding (or requesting) a lease.
///
/// Equality only considers `username`, `hostname` and `pid`; metadata is carried
/// along for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolderIdentity {
    username: String,
    hostname: String,
    pid: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

impl HolderIdentity {
    pub fn new(username: impl Into<String>, hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            username: username.into(),
            hostname: hostname.into(),
            pid,
            metadata: BTreeMap::new(),
        }
    }

    /// Identity of the running process.
    pub fn current() -> Self {
        Self::new(current_username(), current_hostname(), std::process::id())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Same user on the same host, regardless of process.
    pub fn is_same_machine_identity(&self, other: &HolderIdentity) -> bool {
        self.username == other.username && self.hostname == other.hostname
    }

    /// Whether the process named by this identity is still running on this machine.
    ///
    /// Only meaningful when called on the host the identity claims.
    pub fn is_process_alive(&self) -> bool {
        self.is_process_alive_with(&SystemProbe)
    }

    /// Like [`Self::is_process_alive`], asking the given probe. Anything short of a
    /// conclusive "absent" counts as alive.
    pub fn is_process_alive_with(&self, probe: &dyn ProcessProbe) -> bool {
        probe.probe(self.pid) != ProcessStatus::Absent
    }

    /// Encode for the record's holder field.
    pub fn to_wire(&self) -> String {
        let mut value = serde_json::json!({
            "username": self.username,
            "hostname": self.hostname,
            "pid": self.pid,
        });
        if !self.metadata.is_empty() {
            value["metadata"] = serde_json::json!(self.metadata);
        }
        value.to_string()
    }

    pub fn from_wire(input: &str) -> Result<Self, LeaseError> {
        serde_json::from_str(input).map_err(|source| LeaseError::MalformedHolder {
            input: input.to_string(),
            source,
        })
    }
}

impl PartialEq for HolderIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username && self.hostname == other.hostname && self.pid == other.pid
    }
}

impl Eq for HolderIdentity {}

impl fmt::Display for HolderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.pid)
    }
}

fn current_username() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn current_hostname() -> String {
    if let Some(host) = std::env::var("HOSTNAME").ok().filter(|v| !v.is_empty()) {
        return host;
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|contents| contents.trim().to_string())
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Outcome of a process liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Absent,
    /// The probe could not tell.
    Unknown,
}

/// Capability answering whether a pid is running on the local machine.
pub trait ProcessProbe: Send + Sync {
    fn probe(&self, pid: u32) -> ProcessStatus;
}

impl<F> ProcessProbe for F
where
    F: Fn(u32) -> ProcessStatus + Send + Sync,
{
    fn probe(&self, pid: u32) -> ProcessStatus {
        self(pid)
    }
}

/// Probes the OS process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    fn probe(&self, pid: u32) -> ProcessStatus {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return ProcessStatus::Unknown;
        };
        if pid <= 0 {
            return ProcessStatus::Unknown;
        }
        // SAFETY: `kill` takes no pointers and `pid` is a positive process id, so the
        // call cannot touch our memory or signal a process group. Signal 0 delivers
        // nothing; only the existence and permission checks run.
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return ProcessStatus::Running;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => ProcessStatus::Absent,
            // EPERM: the process exists but belongs to someone else.
            Some(libc::EPERM) => ProcessStatus::Running,
            _ => ProcessStatus::Unknown,
        }
    }

    #[cfg(not(unix))]
    fn probe(&self, _pid: u32) -> ProcessStatus {
        ProcessStatus::Unknown
    }
}
