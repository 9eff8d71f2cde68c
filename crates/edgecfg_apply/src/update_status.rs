//! Update Status Protocol v1.0
//!
//! Decides from the control plane's pending-work record whether this run has
//! anything to do, and reports back when it is done:
//! - `check_syncds_state`: config updates, with the wait-for-parents rule
//!   and optional dispersion
//! - `check_revalidate_state`: revalidation-only runs
//! - status markers: one empty file per server status in the status dir
//! - `update_control_plane`: clears pending bits only after a successful run,
//!   or when the remote state is stale
//!
//! A control-plane failure is always an error, never "not needed".

use crate::control_plane::ControlPlane;
use crate::error::ControlPlaneError;
use edgecfg_common::{RunMode, UpdateRequest, UpdateStatusRecord, WaitForParents};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of a run, never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    NotNeeded,
    Needed,
    Successful,
    Failed,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::NotNeeded => "not-needed",
            UpdateStatus::Needed => "needed",
            UpdateStatus::Successful => "successful",
            UpdateStatus::Failed => "failed",
        }
    }
}

/// Result of the syncds check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateCheck {
    pub status: UpdateStatus,
    /// Nothing queued, but a revalidation is; run a revalidate pass instead
    pub revalidate_while_idle: bool,
}

/// Pending bits lowered by `update_control_plane`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClearedFlags {
    pub update: bool,
    pub reval: bool,
}

#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub run_mode: RunMode,
    pub wait_for_parents: WaitForParents,
    pub dispersion_secs: u64,
    pub reval_wait_secs: u64,
    pub status_dir: PathBuf,
    pub report_only: bool,
}

/// A queued config update has to wait while parents still have work
pub fn parents_block_update(record: &UpdateStatusRecord, wait: WaitForParents) -> bool {
    record.parent_pending
        && match wait {
            WaitForParents::True => true,
            WaitForParents::Reval => !record.use_reval_pending,
            WaitForParents::False => false,
        }
}

/// Whether a revalidation pass is due for this record
pub fn revalidation_state(record: &UpdateStatusRecord, wait: WaitForParents) -> UpdateStatus {
    if !record.use_reval_pending {
        debug!("control plane does not track revalidations separately");
        return UpdateStatus::NotNeeded;
    }
    if !record.reval_pending {
        return UpdateStatus::NotNeeded;
    }
    let waits = matches!(wait, WaitForParents::True | WaitForParents::Reval);
    if record.parent_reval_pending && waits {
        info!("revalidation pending, waiting for parents to revalidate first");
        return UpdateStatus::NotNeeded;
    }
    UpdateStatus::Needed
}

fn pause(secs: u64, why: &str) {
    if secs == 0 {
        return;
    }
    info!("sleeping {}s ({})", secs, why);
    thread::sleep(Duration::from_secs(secs));
}

pub struct UpdateStatusProtocol {
    control: Box<dyn ControlPlane>,
    settings: ProtocolSettings,
    /// Record the run's decision was based on
    observed: Option<UpdateStatusRecord>,
}

impl UpdateStatusProtocol {
    pub fn new(control: Box<dyn ControlPlane>, settings: ProtocolSettings) -> Self {
        Self {
            control,
            settings,
            observed: None,
        }
    }

    pub fn control(&self) -> &dyn ControlPlane {
        self.control.as_ref()
    }

    fn fetch(&mut self) -> Result<UpdateStatusRecord, ControlPlaneError> {
        let record = self.control.update_status()?;
        self.observed = Some(record.clone());
        Ok(record)
    }

    /// Is a queued config update ready to apply on this node?
    pub fn check_syncds_state(&mut self) -> Result<StateCheck, ControlPlaneError> {
        let mut record = self.fetch()?;
        let mut check = StateCheck {
            status: UpdateStatus::NotNeeded,
            revalidate_while_idle: false,
        };

        if record.update_pending {
            if self.settings.run_mode == RunMode::Syncds && !self.settings.report_only {
                let secs = self.settings.dispersion_secs;
                if secs > 0 {
                    let delay = rand::thread_rng().gen_range(0..=secs);
                    pause(delay, "dispersion");
                }
            }
            check.status = UpdateStatus::Needed;

            if parents_block_update(&record, self.settings.wait_for_parents) {
                info!("update pending but parents still have pending work");
                if self.settings.run_mode == RunMode::Syncds {
                    pause(self.settings.reval_wait_secs, "waiting for parents");
                    record = self.fetch()?;
                    if record.parent_pending || record.parent_reval_pending {
                        info!("parents still pending, deferring this update");
                        check.status = UpdateStatus::NotNeeded;
                    }
                }
            }
        } else if self.settings.run_mode == RunMode::Syncds {
            info!("no config update pending");
            if revalidation_state(&record, self.settings.wait_for_parents) == UpdateStatus::Needed {
                info!("revalidation pending, running a revalidate pass");
                check.revalidate_while_idle = true;
            }
        } else {
            info!("no config update pending");
        }

        self.reconcile_status_marker(&record.status)?;
        debug!("syncds state: {}", check.status.as_str());
        Ok(check)
    }

    /// Is a revalidation due on this node?
    pub fn check_revalidate_state(&mut self) -> Result<UpdateStatus, ControlPlaneError> {
        let record = self.fetch()?;
        let status = revalidation_state(&record, self.settings.wait_for_parents);
        self.reconcile_status_marker(&record.status)?;
        debug!("revalidate state: {}", status.as_str());
        Ok(status)
    }

    /// Keep exactly one marker file in the status dir, named after the server
    /// status. Marker io problems are logged, an empty status is an error.
    pub fn reconcile_status_marker(&self, status: &str) -> Result<(), ControlPlaneError> {
        let status = status.trim();
        if status.is_empty() {
            return Err(ControlPlaneError::Parse {
                request: "update-status".to_string(),
                reason: "record carries no server status".to_string(),
            });
        }
        if self.settings.report_only {
            debug!("report only, leaving status markers alone");
            return Ok(());
        }
        reconcile_markers(&self.settings.status_dir, status);
        Ok(())
    }

    /// Clear pending bits for `mode` after a run ended in `outcome`.
    ///
    /// The remote record is re-read first. The apply times sent are the update
    /// times observed when the run made its decision, so anything queued
    /// since stays pending.
    pub fn update_control_plane(
        &mut self,
        mode: RunMode,
        outcome: UpdateStatus,
    ) -> Result<ClearedFlags, ControlPlaneError> {
        if self.settings.report_only || mode == RunMode::Report {
            debug!("report only, not updating the control plane");
            return Ok(ClearedFlags::default());
        }
        let fresh = self.control.update_status()?;
        let remote_pending = match mode {
            RunMode::Revalidate => fresh.reval_pending,
            _ => fresh.update_pending,
        };

        let clear = match outcome {
            UpdateStatus::Successful => true,
            UpdateStatus::NotNeeded if remote_pending => {
                warn!("nothing needed changing but the control plane still shows work pending, clearing it");
                true
            }
            UpdateStatus::NotNeeded => {
                info!("no update required");
                false
            }
            UpdateStatus::Failed => {
                error!("run failed, leaving pending flags set");
                false
            }
            UpdateStatus::Needed => {
                warn!("run ended without a result, leaving pending flags set");
                false
            }
        };
        if !clear {
            return Ok(ClearedFlags::default());
        }

        let observed = self.observed.clone().unwrap_or_else(|| fresh.clone());
        let mut request = UpdateRequest::default();
        let mut cleared = ClearedFlags::default();
        if mode == RunMode::Revalidate {
            request.reval_pending = Some(false);
            request.reval_apply_time = observed.reval_update_time.or(fresh.reval_update_time);
            cleared.reval = true;
        } else {
            request.update_pending = Some(false);
            request.config_apply_time = observed.config_update_time.or(fresh.config_update_time);
            cleared.update = true;
        }

        self.control.send_update(&request)?;
        info!(
            "control plane updated (update flag cleared: {}, reval flag cleared: {})",
            cleared.update, cleared.reval
        );
        Ok(cleared)
    }
}

fn reconcile_markers(dir: &Path, status: &str) {
    if let Err(e) = fs::create_dir_all(dir) {
        warn!("cannot create status dir {}: {}", dir.display(), e);
        return;
    }
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file && entry.file_name() != status {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("removing stale status marker {}: {}", entry.path().display(), e);
                }
            }
        }
    }
    let marker = dir.join(status);
    if !marker.exists() {
        if let Err(e) = fs::write(&marker, "") {
            warn!("writing status marker {}: {}", marker.display(), e);
        }
    }
}
