//! Preview registry
//!
//! In-memory source of truth mapping a site identifier to its preview record,
//! plus the monotonic port counter. Nothing here is persisted; a restart of
//! the orchestrator loses every record and callers are expected to re-start.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use preview_core::PreviewStatus;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::supervisor::ProcessHandle;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no preview ports left (counter passed {0})")]
    PortsExhausted(u32),
}

/// How a dev server process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

/// Lifecycle of a preview record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewState {
    /// Process spawned, readiness probe not yet passed
    Starting { requested_at: DateTime<Utc> },
    Running { pid: u32 },
    /// `exit` is `None` when stopped by command before the exit was observed
    Stopped { exit: Option<ExitInfo> },
}

impl PreviewState {
    pub fn status(&self) -> PreviewStatus {
        match self {
            PreviewState::Starting { .. } => PreviewStatus::Starting,
            PreviewState::Running { .. } => PreviewStatus::Running,
            PreviewState::Stopped { .. } => PreviewStatus::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PreviewState::Running { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, PreviewState::Stopped { .. })
    }
}

/// One record per site. Owns the handle of at most one live process.
#[derive(Debug)]
pub struct PreviewRecord {
    pub site_id: String,
    pub port: u16,
    pub state: PreviewState,
    pub last_activity: DateTime<Utc>,
    /// Address the proxy forwards to (set by the readiness probe)
    pub upstream: SocketAddr,
    pub process: Option<ProcessHandle>,
}

impl PreviewRecord {
    pub fn starting(site_id: impl Into<String>, port: u16) -> Self {
        let now = Utc::now();
        Self {
            site_id: site_id.into(),
            port,
            state: PreviewState::Starting { requested_at: now },
            last_activity: now,
            upstream: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            process: None,
        }
    }

    fn snapshot(&self) -> PreviewSnapshot {
        PreviewSnapshot {
            site_id: self.site_id.clone(),
            port: self.port,
            state: self.state.clone(),
            last_activity: self.last_activity,
            upstream: self.upstream,
        }
    }
}

/// Read-only copy of a record handed to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewSnapshot {
    pub site_id: String,
    pub port: u16,
    pub state: PreviewState,
    pub last_activity: DateTime<Utc>,
    pub upstream: SocketAddr,
}

impl PreviewSnapshot {
    pub fn status(&self) -> PreviewStatus {
        self.state.status()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.state {
            PreviewState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            PreviewState::Stopped { exit: Some(exit) } => exit.code,
            _ => None,
        }
    }
}

pub struct Registry {
    records: RwLock<HashMap<String, PreviewRecord>>,
    next_port: AtomicU32,
}

impl Registry {
    pub fn new(first_port: u16) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_port: AtomicU32::new(first_port as u32),
        }
    }

    /// Hand out the next port. Ports are never recycled.
    pub fn allocate_port(&self) -> Result<u16, RegistryError> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        u16::try_from(port).map_err(|_| RegistryError::PortsExhausted(port))
    }

    pub fn get(&self, site_id: &str) -> Option<PreviewSnapshot> {
        self.records.read().get(site_id).map(PreviewRecord::snapshot)
    }

    /// Insert or replace the record for a site. Returns the process handle of
    /// the replaced record, if it still owned one.
    pub fn insert(&self, record: PreviewRecord) -> Option<ProcessHandle> {
        let mut records = self.records.write();
        records
            .insert(record.site_id.clone(), record)
            .and_then(|mut old| old.process.take())
    }

    /// Bump `last_activity`. Returns false for unknown sites.
    pub fn touch(&self, site_id: &str) -> bool {
        match self.records.write().get_mut(site_id) {
            Some(record) => {
                record.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn set_process(&self, site_id: &str, port: u16, handle: ProcessHandle) -> Option<ProcessHandle> {
        let mut records = self.records.write();
        match records.get_mut(site_id) {
            Some(record) if record.port == port => {
                record.process = Some(handle);
                None
            }
            _ => Some(handle),
        }
    }

    /// Transition `starting -> running` for the run on `port`.
    ///
    /// Returns false if the record moved on (stopped, or replaced by another run).
    pub fn mark_running(&self, site_id: &str, port: u16, pid: u32, upstream: SocketAddr) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(site_id) else {
            return false;
        };
        if record.port != port || !matches!(record.state, PreviewState::Starting { .. }) {
            return false;
        }
        record.state = PreviewState::Running { pid };
        record.upstream = upstream;
        record.last_activity = Utc::now();
        true
    }

    /// Mark the run on `port` stopped and drop its process handle.
    ///
    /// Exits of runs that were already replaced are ignored.
    pub fn mark_exited(&self, site_id: &str, port: u16, exit: ExitInfo) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(site_id) else {
            return false;
        };
        if record.port != port {
            return false;
        }
        record.state = PreviewState::Stopped { exit: Some(exit) };
        record.process = None;
        true
    }

    /// Mark a site stopped regardless of its state, returning its process handle.
    pub fn mark_stopped(&self, site_id: &str) -> Option<ProcessHandle> {
        let mut records = self.records.write();
        let record = records.get_mut(site_id)?;
        if !record.state.is_stopped() {
            record.state = PreviewState::Stopped { exit: None };
        }
        record.process.take()
    }

    /// (active, total) where active means not stopped
    pub fn counts(&self) -> (usize, usize) {
        let records = self.records.read();
        let active = records.values().filter(|r| !r.state.is_stopped()).count();
        (active, records.len())
    }

    /// Running sites whose last activity is older than `timeout` at `now`.
    pub fn idle_sites(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let records = self.records.read();
        let mut sites: Vec<String> = records
            .values()
            .filter(|r| r.state.is_running())
            .filter(|r| {
                (now - r.last_activity)
                    .to_std()
                    .map(|idle| idle > timeout)
                    .unwrap_or(false)
            })
            .map(|r| r.site_id.clone())
            .collect();
        sites.sort();
        sites
    }

    /// Sites whose record is not stopped
    pub fn live_sites(&self) -> Vec<String> {
        let records = self.records.read();
        let mut sites: Vec<String> = records
            .values()
            .filter(|r| !r.state.is_stopped())
            .map(|r| r.site_id.clone())
            .collect();
        sites.sort();
        sites
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, site_id: &str, at: DateTime<Utc>) {
        if let Some(record) = self.records.write().get_mut(site_id) {
            record.last_activity = at;
        }
    }
}
