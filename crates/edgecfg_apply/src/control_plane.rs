//! Control Plane v1.0
//!
//! Everything the agent asks of, or tells, the control plane:
//! - pending-work status for this server
//! - the package manifest
//! - boot enablement (chkconfig) entries
//! - clearing pending bits after a run
//!
//! The wire protocol lives in external helper tools. The request helper
//! prints JSON on stdout, the update helper reads a JSON `UpdateRequest`
//! on stdin.

use crate::error::ControlPlaneError;
use crate::exec::CommandRunner;
use edgecfg_common::{ChkconfigEntry, PackageEntry, UpdateRequest, UpdateStatusRecord};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub trait ControlPlane: Send + Sync {
    /// Current pending-work record for this server
    fn update_status(&self) -> Result<UpdateStatusRecord, ControlPlaneError>;

    /// Desired package manifest
    fn packages(&self) -> Result<Vec<PackageEntry>, ControlPlaneError>;

    /// Services to enable at boot
    fn chkconfig(&self) -> Result<Vec<ChkconfigEntry>, ControlPlaneError>;

    fn send_update(&self, request: &UpdateRequest) -> Result<(), ControlPlaneError>;
}

// ============================================================================
// Helper Commands (Production)
// ============================================================================

pub struct CommandControlPlane {
    runner: Arc<dyn CommandRunner>,
    request_cmd: String,
    update_cmd: String,
    cache_host_name: String,
}

impl CommandControlPlane {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        request_cmd: &str,
        update_cmd: &str,
        cache_host_name: &str,
    ) -> Self {
        Self {
            runner,
            request_cmd: request_cmd.to_string(),
            update_cmd: update_cmd.to_string(),
            cache_host_name: cache_host_name.to_string(),
        }
    }

    fn get<T: DeserializeOwned>(&self, data: &str) -> Result<T, ControlPlaneError> {
        let get_data = format!("--get-data={}", data);
        let host = format!("--cache-host-name={}", self.cache_host_name);
        let out = self
            .runner
            .run(&self.request_cmd, &[get_data.as_str(), host.as_str()])
            .map_err(|e| ControlPlaneError::Request {
                request: data.to_string(),
                reason: e.to_string(),
            })?;
        if !out.success() {
            return Err(ControlPlaneError::Request {
                request: data.to_string(),
                reason: out.reason(),
            });
        }
        serde_json::from_str(&out.stdout).map_err(|e| ControlPlaneError::Parse {
            request: data.to_string(),
            reason: e.to_string(),
        })
    }
}

impl ControlPlane for CommandControlPlane {
    fn update_status(&self) -> Result<UpdateStatusRecord, ControlPlaneError> {
        let record: UpdateStatusRecord = self.get("update-status")?;
        debug!(
            "update status: update_pending={} reval_pending={} parent_pending={} parent_reval_pending={}",
            record.update_pending,
            record.reval_pending,
            record.parent_pending,
            record.parent_reval_pending
        );
        Ok(record)
    }

    fn packages(&self) -> Result<Vec<PackageEntry>, ControlPlaneError> {
        self.get("packages")
    }

    fn chkconfig(&self) -> Result<Vec<ChkconfigEntry>, ControlPlaneError> {
        self.get("chkconfig")
    }

    fn send_update(&self, request: &UpdateRequest) -> Result<(), ControlPlaneError> {
        let update_err = |reason| ControlPlaneError::Request {
            request: "update".to_string(),
            reason,
        };
        let body = serde_json::to_string(request).map_err(|e| update_err(e.to_string()))?;
        let host = format!("--cache-host-name={}", self.cache_host_name);
        let out = self
            .runner
            .run_with_input(&self.update_cmd, &[host.as_str()], &body)
            .map_err(|e| update_err(e.to_string()))?;
        if !out.success() {
            return Err(update_err(out.reason()));
        }
        Ok(())
    }
}

// ============================================================================
// Fake Control Plane (Testing)
// ============================================================================

#[derive(Debug, Default)]
struct FakeControlPlaneState {
    statuses: VecDeque<UpdateStatusRecord>,
    packages: Vec<PackageEntry>,
    chkconfig: Vec<ChkconfigEntry>,
    fail_status: bool,
    fail_update: bool,
    status_queries: usize,
    updates: Vec<UpdateRequest>,
}

/// Scripted control plane. Status records are served in order and the last
/// one repeats. A sent update lowers the matching bits of the served record.
#[derive(Debug, Clone, Default)]
pub struct FakeControlPlane {
    state: Arc<Mutex<FakeControlPlaneState>>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a status record
    pub fn with_status(self, record: UpdateStatusRecord) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.statuses.push_back(record);
        }
        self
    }

    pub fn with_packages(self, packages: Vec<PackageEntry>) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.packages = packages;
        }
        self
    }

    pub fn with_chkconfig(self, entries: Vec<ChkconfigEntry>) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.chkconfig = entries;
        }
        self
    }

    /// Every status query fails
    pub fn with_status_failure(self) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.fail_status = true;
        }
        self
    }

    /// Every update call fails
    pub fn with_update_failure(self) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.fail_update = true;
        }
        self
    }

    /// Updates sent so far
    pub fn updates(&self) -> Vec<UpdateRequest> {
        self.state.lock().map(|s| s.updates.clone()).unwrap_or_default()
    }

    pub fn status_queries(&self) -> usize {
        self.state.lock().map(|s| s.status_queries).unwrap_or(0)
    }

    /// Record the next query would return
    pub fn current_status(&self) -> UpdateStatusRecord {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.statuses.front().cloned())
            .unwrap_or_default()
    }
}

fn poisoned(request: &str) -> ControlPlaneError {
    ControlPlaneError::Request {
        request: request.to_string(),
        reason: "fake state poisoned".to_string(),
    }
}

impl ControlPlane for FakeControlPlane {
    fn update_status(&self) -> Result<UpdateStatusRecord, ControlPlaneError> {
        let mut s = self.state.lock().map_err(|_| poisoned("update-status"))?;
        s.status_queries += 1;
        if s.fail_status {
            return Err(ControlPlaneError::Request {
                request: "update-status".to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        if s.statuses.len() > 1 {
            return Ok(s.statuses.pop_front().unwrap_or_default());
        }
        Ok(s.statuses.front().cloned().unwrap_or_default())
    }

    fn packages(&self) -> Result<Vec<PackageEntry>, ControlPlaneError> {
        let s = self.state.lock().map_err(|_| poisoned("packages"))?;
        Ok(s.packages.clone())
    }

    fn chkconfig(&self) -> Result<Vec<ChkconfigEntry>, ControlPlaneError> {
        let s = self.state.lock().map_err(|_| poisoned("chkconfig"))?;
        Ok(s.chkconfig.clone())
    }

    fn send_update(&self, request: &UpdateRequest) -> Result<(), ControlPlaneError> {
        let mut s = self.state.lock().map_err(|_| poisoned("update"))?;
        s.updates.push(request.clone());
        if s.fail_update {
            return Err(ControlPlaneError::Request {
                request: "update".to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        for record in s.statuses.iter_mut() {
            if let Some(pending) = request.update_pending {
                record.update_pending = pending;
            }
            if let Some(pending) = request.reval_pending {
                record.reval_pending = pending;
            }
        }
        Ok(())
    }
}
