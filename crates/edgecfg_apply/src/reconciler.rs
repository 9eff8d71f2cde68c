//! Reconciler v1.0
//!
//! One run of the agent, start to finish:
//! 1. single-instance lock, previous metadata, initial git commit
//! 2. user check, then the update-status check for the run mode
//! 3. packages and boot enablement (full-scope runs only)
//! 4. desired snapshot, audit, apply
//! 5. one cache service action, then the auxiliary services
//! 6. report upstream, write metadata, final git commit
//!
//! Run state goes `NotNeeded -> Needed -> {Successful | Failed}`. A failure
//! skips the optional steps but the metadata, the final commit and the
//! upstream report are always attempted.

use crate::audit::{AuditContext, ConfigAuditor, PLUGIN_CONFIG, REMAP_CONFIG};
use crate::audit::udev::UdevAudit;
use crate::config::Config;
use crate::config_file::{ConfigFile, Ownership};
use crate::control_plane::ControlPlane;
use crate::error::{PackageError, ServiceError};
use crate::exec::CommandRunner;
use crate::fs_apply::{ApplyScope, FileSystemApplier};
use crate::generator::ConfigGenerator;
use crate::git::{GitRecorder, MAX_LOCK_AGE};
use crate::lock::AppLock;
use crate::packages::{PackageManager, PackageReconciler};
use crate::privilege;
use crate::restart::{aggregate, RestartData};
use crate::service_control::{ReloadClassifier, ServiceAction, ServiceController, ServiceSettings};
use crate::services::ServiceManager;
use crate::update_status::{ProtocolSettings, UpdateStatus, UpdateStatusProtocol};
use chrono::Utc;
use edgecfg_common::{
    ActionStatus, ApplyFiles, ApplyMetaData, ConfigFileRecord, ExitCode, RunMode, UseGit,
    ACTION_APPLY_END, ACTION_APPLY_START, ACTION_CHECK_STATUS, ACTION_CHECK_USER,
    ACTION_GENERATE, ACTION_GIT_COMMIT_FINAL, ACTION_GIT_COMMIT_INITIAL, ACTION_GIT_INIT,
    ACTION_PACKAGES, ACTION_SERVICE, ACTION_SYSTEM_SERVICES, ACTION_UPDATE_CONTROL_PLANE,
    ACTION_UPDATE_FILES_ALL, ACTION_UPDATE_FILES_REVAL, METADATA_FILE_NAME,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Everything a run talks to outside its own process
pub struct Collaborators {
    pub control_plane: Box<dyn ControlPlane>,
    pub generator: Box<dyn ConfigGenerator>,
    pub packages: Box<dyn PackageManager>,
    pub services: Box<dyn ServiceManager>,
    pub classifier: Box<dyn ReloadClassifier>,
    pub runner: Arc<dyn CommandRunner>,
}

/// How a run ended
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: ExitCode,
    pub update_status: UpdateStatus,
    pub metadata: ApplyMetaData,
    pub warnings: Vec<String>,
}

/// Result of the audit and apply loop
struct FileResults {
    files: Vec<ConfigFile>,
    restart: RestartData,
    changed: Vec<String>,
    failed: bool,
}

pub struct Reconciler {
    config: Config,
    run_mode: RunMode,
    files: ApplyFiles,
    protocol: UpdateStatusProtocol,
    generator: Box<dyn ConfigGenerator>,
    packages: PackageReconciler,
    services: ServiceController,
    git: GitRecorder,
    ownership: Ownership,
    status: UpdateStatus,
    metadata: ApplyMetaData,
    previous: Option<ApplyMetaData>,
    warnings: Vec<String>,
    git_active: bool,
}

impl Reconciler {
    /// `config` must already have its run mode applied
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let a = &config.apply;
        let protocol = UpdateStatusProtocol::new(
            collaborators.control_plane,
            ProtocolSettings {
                run_mode: a.run_mode,
                wait_for_parents: a.wait_for_parents,
                dispersion_secs: a.dispersion_secs,
                reval_wait_secs: a.reval_wait_secs,
                status_dir: a.status_dir.clone(),
                report_only: a.report_only,
            },
        );
        let services = ServiceController::new(
            collaborators.services,
            collaborators.classifier,
            collaborators.runner.clone(),
            ServiceSettings {
                run_mode: a.run_mode,
                cache_type: a.cache_type,
                service_action: a.service_action,
                report_only: a.report_only,
                confirm: !a.no_confirm_service_action,
                traffic_ctl: a.traffic_ctl(),
                diags_log: config.tail.diags_log_path(&a.ts_home),
                restart_marker: config.tail.restart_marker.clone(),
                reload_marker: config.tail.reload_marker.clone(),
                restart_timeout: Duration::from_millis(config.tail.restart_timeout_ms),
                reload_timeout: Duration::from_millis(config.tail.reload_timeout_ms),
                poll_interval: Duration::from_millis(config.tail.poll_interval_ms),
            },
        );
        let git = GitRecorder::new(
            collaborators.runner,
            &config.tools.git_cmd,
            &a.config_dir(),
            a.use_git,
        );
        Self {
            run_mode: a.run_mode,
            files: a.files,
            packages: PackageReconciler::new(collaborators.packages, a.install_packages),
            ownership: Ownership::resolve(&a.cache_user),
            metadata: ApplyMetaData::new(&a.cache_host_name),
            generator: collaborators.generator,
            protocol,
            services,
            git,
            status: UpdateStatus::NotNeeded,
            previous: None,
            warnings: Vec::new(),
            git_active: false,
            config,
        }
    }

    /// Use fixed file ownership instead of looking up the cache user
    pub fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }

    fn metadata_path(&self) -> PathBuf {
        self.config.apply.config_dir().join(METADATA_FILE_NAME)
    }

    fn report_only(&self) -> bool {
        self.config.apply.report_only
    }

    /// Execute one run
    pub fn run(mut self) -> RunOutcome {
        let lock_path = self.config.apply.lock_file.clone();
        let lock = match AppLock::try_acquire(&lock_path) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                error!("another run holds {}, exiting", lock_path.display());
                return self.outcome(ExitCode::AlreadyRunning);
            }
            Err(e) => {
                error!("{}", e);
                return self.outcome(ExitCode::GeneralFailure);
            }
        };

        info!(
            "edgecfg-apply starting: host={} mode={} files={}",
            self.config.apply.cache_host_name,
            self.run_mode,
            self.files.as_str()
        );
        self.metadata.record(ACTION_APPLY_START, ActionStatus::Success);
        self.previous = ApplyMetaData::load(&self.metadata_path());

        let code = self.run_locked();
        self.finish(code);
        debug!("releasing {}", lock.path().display());
        drop(lock);
        self.outcome(code)
    }

    fn outcome(self, exit_code: ExitCode) -> RunOutcome {
        RunOutcome {
            exit_code,
            update_status: self.status,
            metadata: self.metadata,
            warnings: self.warnings,
        }
    }

    // ========================================================================
    // Run Steps
    // ========================================================================

    fn run_locked(&mut self) -> ExitCode {
        self.start_git();

        let user_ok = privilege::check_user(self.run_mode, self.config.apply.check_user);
        self.metadata.record(ACTION_CHECK_USER, ActionStatus::from_ok(user_ok));
        if !user_ok {
            return ExitCode::UserCheckError;
        }

        if let Some(code) = self.check_status() {
            return code;
        }

        if self.files == ApplyFiles::All {
            if let Some(code) = self.process_packages() {
                return code;
            }
            if self.run_mode == RunMode::Badass {
                if let Some(code) = self.enable_system_services() {
                    return code;
                }
            }
        } else {
            debug!("revalidate scope, no package processing");
            if let Some(previous) = &self.previous {
                self.metadata.installed_packages = previous.installed_packages.clone();
            }
        }

        let records = match self.generator.generate(self.files) {
            Ok(records) => {
                self.metadata.record(ACTION_GENERATE, ActionStatus::Success);
                records
            }
            Err(e) => {
                error!("{}", e);
                self.metadata.record(ACTION_GENERATE, ActionStatus::Failure);
                self.status = UpdateStatus::Failed;
                return ExitCode::ConfigFilesError;
            }
        };

        let results = self.process_files(records);
        let files_action = match self.files {
            ApplyFiles::All => ACTION_UPDATE_FILES_ALL,
            ApplyFiles::Reval => ACTION_UPDATE_FILES_REVAL,
        };
        self.metadata
            .record(files_action, ActionStatus::from_ok(!results.failed));
        self.status = if results.failed {
            UpdateStatus::Failed
        } else if self.report_only() {
            if results.files.iter().any(|f| f.audit.change_needed) {
                UpdateStatus::Needed
            } else {
                UpdateStatus::NotNeeded
            }
        } else if results.changed.is_empty() {
            UpdateStatus::NotNeeded
        } else {
            UpdateStatus::Needed
        };
        info!("{} files changed, run is {}", results.changed.len(), self.status.as_str());

        if results.restart.remap_config_reload && !self.report_only() {
            self.touch_remap(&results.files);
        }

        match self.service_step(&results.restart, &results.changed) {
            Ok(()) => {
                self.metadata.record(ACTION_SERVICE, ActionStatus::Success);
                if self.status == UpdateStatus::Needed && !self.report_only() {
                    self.status = UpdateStatus::Successful;
                }
            }
            Err(e) => {
                error!("service action failed: {}", e);
                self.metadata.record(ACTION_SERVICE, ActionStatus::Failure);
                self.metadata.partial_success = true;
                self.status = UpdateStatus::Failed;
                return ExitCode::ServicesError;
            }
        }

        if self.status == UpdateStatus::Failed {
            warn!("run failed, skipping auxiliary service steps");
        } else {
            let teakd = !self.report_only() && self.packages.is_installed("teakd");
            let failures = self.services.run_aux_steps(&results.restart, teakd);
            self.warnings.extend(failures);
        }

        self.summarize_warnings(&results.files);

        let mut code = if self.status == UpdateStatus::Failed {
            ExitCode::ConfigFilesError
        } else {
            ExitCode::Success
        };
        if let Err(code_from_update) = self.report_upstream() {
            if code.is_success() {
                code = code_from_update;
            }
        }
        code
    }

    fn start_git(&mut self) {
        if self.report_only() {
            debug!("report only, no git commits");
            return;
        }
        match self.git.ensure_repo() {
            Ok(active) => {
                self.git_active = active;
                if self.config.apply.use_git == UseGit::Yes {
                    self.metadata.record(ACTION_GIT_INIT, ActionStatus::Success);
                }
            }
            Err(e) => {
                error!("{}", e);
                self.metadata.record(ACTION_GIT_INIT, ActionStatus::Failure);
                return;
            }
        }
        if !self.git_active {
            return;
        }
        self.git.remove_stale_lock(MAX_LOCK_AGE);
        match self.git.commit_all(false, true) {
            Ok(_) => self
                .metadata
                .record(ACTION_GIT_COMMIT_INITIAL, ActionStatus::Success),
            Err(e) => {
                error!("git committing existing changes: {}", e);
                self.metadata
                    .record(ACTION_GIT_COMMIT_INITIAL, ActionStatus::Failure);
            }
        }
    }

    /// `Some(code)` when the run ends here
    fn check_status(&mut self) -> Option<ExitCode> {
        if self.files == ApplyFiles::Reval {
            return match self.protocol.check_revalidate_state() {
                Err(e) => {
                    error!("checking revalidate state: {}", e);
                    self.metadata.record(ACTION_CHECK_STATUS, ActionStatus::Failure);
                    Some(ExitCode::RevalidationError)
                }
                Ok(UpdateStatus::NotNeeded) => {
                    info!("no revalidation needed");
                    self.metadata.record(ACTION_CHECK_STATUS, ActionStatus::Success);
                    Some(ExitCode::Success)
                }
                Ok(_) => {
                    self.metadata.record(ACTION_CHECK_STATUS, ActionStatus::Success);
                    self.status = UpdateStatus::Needed;
                    None
                }
            };
        }

        let check = match self.protocol.check_syncds_state() {
            Ok(check) => check,
            Err(e) => {
                error!("checking update state: {}", e);
                self.metadata.record(ACTION_CHECK_STATUS, ActionStatus::Failure);
                return Some(ExitCode::SyncError);
            }
        };
        self.metadata.record(ACTION_CHECK_STATUS, ActionStatus::Success);

        if check.revalidate_while_idle {
            info!("switching to a revalidate pass");
            self.run_mode = RunMode::Revalidate;
            self.files = ApplyFiles::Reval;
            self.status = UpdateStatus::Needed;
            if let Some(previous) = &self.previous {
                self.metadata.installed_packages = previous.installed_packages.clone();
            }
            return None;
        }
        if check.status == UpdateStatus::NotNeeded && !self.config.apply.ignore_update_flag {
            info!("no update pending, nothing to do");
            return Some(ExitCode::Success);
        }
        self.status = check.status;
        None
    }

    /// `Some(code)` when the run ends here
    fn process_packages(&mut self) -> Option<ExitCode> {
        let desired = match self.protocol.control().packages() {
            Ok(desired) => desired,
            Err(e) => {
                error!("fetching package manifest: {}", e);
                self.metadata.record(ACTION_PACKAGES, ActionStatus::Failure);
                self.status = UpdateStatus::Failed;
                return Some(ExitCode::PackagingError);
            }
        };

        match self.packages.reconcile(&desired) {
            Ok(installed) => {
                self.metadata.installed_packages = installed
                    .into_iter()
                    .filter(|(_, ok)| *ok)
                    .map(|(name, _)| name)
                    .collect();
                self.metadata.record(ACTION_PACKAGES, ActionStatus::Success);
                None
            }
            Err(PackageError::Mismatch(changes)) if !self.config.apply.install_packages => {
                error!(
                    "installed packages differ from the manifest and installing is disabled: {}",
                    changes.join(", ")
                );
                self.metadata.record(ACTION_PACKAGES, ActionStatus::Failure);
                None
            }
            Err(e) => {
                error!("processing packages: {}", e);
                self.metadata.record(ACTION_PACKAGES, ActionStatus::Failure);
                self.status = UpdateStatus::Failed;
                Some(ExitCode::PackagingError)
            }
        }
    }

    /// `Some(code)` when the run ends here
    fn enable_system_services(&mut self) -> Option<ExitCode> {
        let result = self
            .protocol
            .control()
            .chkconfig()
            .map_err(|e| e.to_string())
            .and_then(|entries| {
                self.services
                    .enable_boot_services(&entries)
                    .map_err(|e| e.to_string())
            });
        match result {
            Ok(()) => {
                self.metadata
                    .record(ACTION_SYSTEM_SERVICES, ActionStatus::Success);
                None
            }
            Err(e) => {
                error!("verifying system services: {}", e);
                self.metadata
                    .record(ACTION_SYSTEM_SERVICES, ActionStatus::Failure);
                self.status = UpdateStatus::Failed;
                Some(ExitCode::ServicesError)
            }
        }
    }

    fn process_files(&mut self, records: Vec<ConfigFileRecord>) -> FileResults {
        let a = &self.config.apply;
        let config_dir = a.config_dir();
        let mut files: Vec<ConfigFile> = records
            .iter()
            .map(|r| ConfigFile::from_record(r, &a.ts_home, &a.backup_dir, &self.ownership))
            .collect();
        let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
        self.metadata.owned_files = files
            .iter()
            .map(|f| f.path.to_string_lossy().to_string())
            .collect();

        let mut auditor = ConfigAuditor::new(AuditContext {
            config_dir: config_dir.clone(),
            plugin_dir: a.plugin_dir(),
            udev: UdevAudit::default(),
            report_only: a.report_only,
        });
        auditor.prepare(&files);

        let mut failed = false;
        for file in files.iter_mut() {
            if auditor.audit(file, &names).is_err() {
                failed = true;
            }
        }
        couple_prerequisites(&mut files);

        let applier = FileSystemApplier::new(
            ApplyScope {
                run_mode: self.run_mode,
                files: self.files,
                report_only: a.report_only,
                sync_ds_updates_ip_allow: a.sync_ds_updates_ip_allow,
            },
            config_dir,
        );
        let mut per_file = Vec::new();
        let mut changed = Vec::new();
        for file in files.iter_mut() {
            if file.audit.failed {
                failed = true;
                continue;
            }
            match applier.apply(file) {
                Ok(restart) => {
                    if file.audit.change_applied {
                        changed.push(file.path.to_string_lossy().to_string());
                    }
                    per_file.push(restart);
                }
                Err(e) => {
                    error!("{}", e);
                    failed = true;
                }
            }
        }

        FileResults {
            restart: aggregate(&per_file),
            files,
            changed,
            failed,
        }
    }

    fn touch_remap(&self, files: &[ConfigFile]) {
        let Some(remap) = files.iter().find(|f| f.name == REMAP_CONFIG) else {
            return;
        };
        match self.services.touch(&remap.path) {
            Ok(()) => info!("updated remap.config mtime for reloading"),
            Err(e) => error!("failed to update remap.config for reloading: {}", e),
        }
    }

    fn service_step(&mut self, restart: &RestartData, changed: &[String]) -> Result<(), ServiceError> {
        let plugin_packages = self.packages.installed_this_run().to_vec();
        let action = self.services.decide(changed, &plugin_packages, restart)?;
        if action == ServiceAction::None {
            return Ok(());
        }
        let service = self.services.cache_service();
        if !self.report_only() && !self.packages.is_installed(service) {
            return Err(ServiceError::Command {
                service: service.to_string(),
                action: action.as_str().to_string(),
                reason: "package is not installed".to_string(),
            });
        }
        let confirmation = self.services.execute(action)?;
        debug!("{} {}: {}", action.as_str(), service, confirmation.as_str());
        if !self.report_only() {
            match action {
                ServiceAction::Restart => self.metadata.restarted_cache = true,
                ServiceAction::Reload => self.metadata.reloaded_cache = true,
                ServiceAction::None => {}
            }
        }
        Ok(())
    }

    fn summarize_warnings(&mut self, files: &[ConfigFile]) {
        let mut all: Vec<String> = files
            .iter()
            .flat_map(|f| f.warnings.iter().map(move |w| format!("{}: {}", f.name, w)))
            .collect();
        all.append(&mut self.warnings);
        if all.is_empty() {
            return;
        }
        warn!("{} warnings this run:", all.len());
        for w in &all {
            warn!("  {}", w);
        }
        self.warnings = all;
    }

    /// Clear pending bits upstream. `Err` carries the exit code to use.
    fn report_upstream(&mut self) -> Result<(), ExitCode> {
        if self.report_only() {
            self.metadata
                .record(ACTION_UPDATE_CONTROL_PLANE, ActionStatus::Skipped);
            return Ok(());
        }
        match self.protocol.update_control_plane(self.run_mode, self.status) {
            Ok(cleared) => {
                self.metadata.unset_update_flag = cleared.update;
                self.metadata.unset_reval_flag = cleared.reval;
                self.metadata
                    .record(ACTION_UPDATE_CONTROL_PLANE, ActionStatus::Success);
                Ok(())
            }
            Err(e) => {
                error!("failed to update the control plane: {}", e);
                self.metadata
                    .record(ACTION_UPDATE_CONTROL_PLANE, ActionStatus::Failure);
                Err(ExitCode::SyncError)
            }
        }
    }

    // ========================================================================
    // Finish
    // ========================================================================

    /// Metadata and the final commit, on every path past the lock
    fn finish(&mut self, code: ExitCode) {
        self.metadata.succeeded = code.is_success();
        self.metadata.end_time = Some(Utc::now());
        if let Some(previous) = &self.previous {
            // files from earlier runs stay owned, reval runs only see one file
            self.metadata.combine_owned_files(&previous.owned_files);
        }

        if !self.report_only() {
            self.write_metadata();
        }

        // recorded after the metadata is written so the final commit sees a stable file
        if self.git_active {
            match self.git.commit_all(true, code.is_success()) {
                Ok(_) => self
                    .metadata
                    .record(ACTION_GIT_COMMIT_FINAL, ActionStatus::Success),
                Err(e) => {
                    error!("git commit of this run's changes: {}", e);
                    self.metadata
                        .record(ACTION_GIT_COMMIT_FINAL, ActionStatus::Failure);
                }
            }
        }
        self.metadata
            .record(ACTION_APPLY_END, ActionStatus::from_ok(code.is_success()));

        if code.is_success() {
            info!("run finished: {}", self.status.as_str());
        } else {
            error!("run finished with {} ({})", code.as_str(), code.as_i32());
        }
    }

    fn write_metadata(&self) {
        let path = self.metadata_path();
        if let Some(dir) = path.parent() {
            if let Err(e) = fs::create_dir_all(dir) {
                error!("creating {}: {}", dir.display(), e);
                return;
            }
        }
        match self.metadata.save(&path) {
            Ok(()) => debug!("wrote {}", path.display()),
            Err(e) => error!("writing metadata {}: {}", path.display(), e),
        }
    }
}

/// plugin.config and remap.config go in together or not at all
fn couple_prerequisites(files: &mut [ConfigFile]) {
    let coupled = |f: &ConfigFile| f.name == REMAP_CONFIG || f.name == PLUGIN_CONFIG;
    let blocked = files
        .iter()
        .any(|f| coupled(f) && f.audit.pre_req_failed);
    if !blocked {
        return;
    }
    for file in files.iter_mut().filter(|f| coupled(f) && !f.audit.failed) {
        error!(
            "{}: not applied, {} and {} prerequisites failed",
            file.name, PLUGIN_CONFIG, REMAP_CONFIG
        );
        file.fail_audit("prerequisites of the coupled plugin/remap config failed");
    }
}
