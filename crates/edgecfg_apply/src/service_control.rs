//! Service Controller v1.0
//!
//! Turns the run's changes into one cache service action and carries it out:
//! - `decide`: operator override, then the external reload classifier, then
//!   our own restart flags (they win when the classifier knows less)
//! - `execute`: restart (or start) / live reload, then tail the diagnostics
//!   log for the completion marker. A confirmation timeout is only a warning.
//! - auxiliary services (teakd, hitch, ntpd, varnish front end, sysctl)
//! - boot enablement from the control plane's chkconfig list

use crate::error::ServiceError;
use crate::exec::CommandRunner;
use crate::restart::RestartData;
use crate::services::{ServiceManager, ServiceState};
use crate::tail::{marker_pattern, Confirmation, LogCursor};
use edgecfg_common::{CacheType, ChkconfigEntry, RunMode, ServiceActionFlag, ServiceNeeds};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceAction {
    None,
    Reload,
    Restart,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::None => "none",
            ServiceAction::Reload => "reload",
            ServiceAction::Restart => "restart",
        }
    }
}

// ============================================================================
// Reload Classifier
// ============================================================================

/// External judgement of what a set of changed files needs
pub trait ReloadClassifier: Send + Sync {
    fn classify(
        &self,
        mode: RunMode,
        changed_files: &[String],
        plugin_packages: &[String],
    ) -> Result<ServiceNeeds, ServiceError>;
}

#[derive(Serialize)]
struct ClassifierInput<'a> {
    changed_files: &'a [String],
    installed_plugins: &'a [String],
}

pub struct CommandReloadClassifier {
    runner: Arc<dyn CommandRunner>,
    command: String,
}

impl CommandReloadClassifier {
    pub fn new(runner: Arc<dyn CommandRunner>, command: &str) -> Self {
        Self {
            runner,
            command: command.to_string(),
        }
    }
}

impl ReloadClassifier for CommandReloadClassifier {
    fn classify(
        &self,
        mode: RunMode,
        changed_files: &[String],
        plugin_packages: &[String],
    ) -> Result<ServiceNeeds, ServiceError> {
        let input = serde_json::to_string(&ClassifierInput {
            changed_files,
            installed_plugins: plugin_packages,
        })
        .map_err(|e| ServiceError::Classifier(e.to_string()))?;
        let mode_arg = format!("--run-mode={}", mode.as_str());
        let out = self
            .runner
            .run_with_input(&self.command, &[mode_arg.as_str()], &input)
            .map_err(|e| ServiceError::Classifier(e.to_string()))?;
        if !out.success() {
            return Err(ServiceError::Classifier(out.reason()));
        }
        ServiceNeeds::parse(&out.stdout).ok_or_else(|| {
            ServiceError::Classifier(format!("unrecognised answer '{}'", out.stdout.trim()))
        })
    }
}

/// Answers a fixed value and records the changed-file lists it was given
#[derive(Debug, Clone, Default)]
pub struct FakeReloadClassifier {
    needs: Arc<Mutex<ServiceNeeds>>,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

impl FakeReloadClassifier {
    pub fn new(needs: ServiceNeeds) -> Self {
        Self {
            needs: Arc::new(Mutex::new(needs)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ReloadClassifier for FakeReloadClassifier {
    fn classify(
        &self,
        _mode: RunMode,
        changed_files: &[String],
        _plugin_packages: &[String],
    ) -> Result<ServiceNeeds, ServiceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(changed_files.to_vec());
        }
        self.needs
            .lock()
            .map(|n| *n)
            .map_err(|_| ServiceError::Classifier("fake state poisoned".to_string()))
    }
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub run_mode: RunMode,
    pub cache_type: CacheType,
    pub service_action: ServiceActionFlag,
    pub report_only: bool,
    /// Tail the diagnostics log after acting
    pub confirm: bool,
    pub traffic_ctl: PathBuf,
    pub diags_log: PathBuf,
    pub restart_marker: String,
    pub reload_marker: String,
    pub restart_timeout: Duration,
    pub reload_timeout: Duration,
    pub poll_interval: Duration,
}

pub struct ServiceController {
    manager: Box<dyn ServiceManager>,
    classifier: Box<dyn ReloadClassifier>,
    runner: Arc<dyn CommandRunner>,
    settings: ServiceSettings,
}

impl ServiceController {
    pub fn new(
        manager: Box<dyn ServiceManager>,
        classifier: Box<dyn ReloadClassifier>,
        runner: Arc<dyn CommandRunner>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            manager,
            classifier,
            runner,
            settings,
        }
    }

    /// Unit name of the cache service
    pub fn cache_service(&self) -> &'static str {
        self.settings.cache_type.service_name()
    }

    /// Least disruptive action that picks up this run's changes
    pub fn decide(
        &self,
        changed_files: &[String],
        plugin_packages: &[String],
        restart: &RestartData,
    ) -> Result<ServiceAction, ServiceError> {
        match self.settings.service_action {
            ServiceActionFlag::Restart => {
                info!("service action forced to restart");
                return Ok(ServiceAction::Restart);
            }
            ServiceActionFlag::None => {
                info!("service action disabled");
                return Ok(ServiceAction::None);
            }
            ServiceActionFlag::Reload => {}
        }
        if changed_files.is_empty() && restart.is_empty() {
            debug!("nothing changed, no service action");
            return Ok(ServiceAction::None);
        }

        let needs = self
            .classifier
            .classify(self.settings.run_mode, changed_files, plugin_packages)?;
        info!("reload classifier: {}", needs.as_str());
        let mut action = match needs {
            ServiceNeeds::NeedsRestart => ServiceAction::Restart,
            ServiceNeeds::NeedsReload => ServiceAction::Reload,
            ServiceNeeds::NeedsNothing => ServiceAction::None,
        };
        if restart.traffic_server_restart && action < ServiceAction::Restart {
            info!("a changed file requires a cache restart");
            action = ServiceAction::Restart;
        }
        if action == ServiceAction::None && restart.cache_reload_needed() {
            info!("cache config files changed, cache needs reload");
            action = ServiceAction::Reload;
        }
        Ok(action)
    }

    /// Carry out `action` on the cache service and confirm it
    pub fn execute(&self, action: ServiceAction) -> Result<Confirmation, ServiceError> {
        if action == ServiceAction::None {
            return Ok(Confirmation::Skipped);
        }
        let service = self.cache_service();
        if self.settings.report_only {
            error!("{} configuration has changed and needs a {}", service, action.as_str());
            return Ok(Confirmation::Skipped);
        }

        let cursor = LogCursor::at_end(&self.settings.diags_log);
        let (marker, timeout) = match action {
            ServiceAction::Restart => {
                let verb = match self.manager.status(service)? {
                    ServiceState::Running => "restart",
                    _ => "start",
                };
                if verb == "restart" {
                    self.manager.restart(service)?;
                } else {
                    self.manager.start(service)?;
                }
                info!("{} {}ed", service, verb);
                (&self.settings.restart_marker, self.settings.restart_timeout)
            }
            ServiceAction::Reload => {
                self.reload_cache()?;
                (&self.settings.reload_marker, self.settings.reload_timeout)
            }
            ServiceAction::None => return Ok(Confirmation::Skipped),
        };

        if !self.settings.confirm {
            debug!("confirmation skipped");
            return Ok(Confirmation::Skipped);
        }
        self.confirm(cursor, marker, timeout)
    }

    fn reload_cache(&self) -> Result<(), ServiceError> {
        match self.settings.cache_type {
            CacheType::Ats => {
                let program = self.settings.traffic_ctl.to_string_lossy();
                let out = self
                    .runner
                    .run(&program, &["config", "reload"])
                    .map_err(|e| ServiceError::Command {
                        service: self.cache_service().to_string(),
                        action: "reload".to_string(),
                        reason: e.to_string(),
                    })?;
                if !out.success() {
                    return Err(ServiceError::Command {
                        service: self.cache_service().to_string(),
                        action: "reload".to_string(),
                        reason: out.reason(),
                    });
                }
                info!("traffic_ctl config reload succeeded");
                Ok(())
            }
            CacheType::Varnish => self.manager.reload(self.cache_service()),
        }
    }

    fn confirm(
        &self,
        mut cursor: LogCursor,
        marker: &str,
        timeout: Duration,
    ) -> Result<Confirmation, ServiceError> {
        let pattern = marker_pattern(marker).map_err(|e| ServiceError::Command {
            service: self.cache_service().to_string(),
            action: "confirm".to_string(),
            reason: e.to_string(),
        })?;
        let result = cursor.wait_for(&pattern, timeout, self.settings.poll_interval);
        match result {
            Confirmation::Confirmed => info!("service action confirmed in the diagnostics log"),
            _ => warn!(
                "no '{}' in {} after {:?}, continuing",
                marker,
                self.settings.diags_log.display(),
                timeout
            ),
        }
        Ok(result)
    }

    /// Auxiliary service steps. Failures are returned as messages, never fatal.
    pub fn run_aux_steps(&self, restart: &RestartData, teakd_installed: bool) -> Vec<String> {
        let mut failures = Vec::new();
        if self.settings.report_only {
            return failures;
        }
        let mut note = |result: Result<(), ServiceError>| {
            if let Err(e) = result {
                error!("{}", e);
                failures.push(e.to_string());
            }
        };

        if teakd_installed {
            note(self.ensure_started("teakd", restart.teakd_restart));
        }
        if restart.hitch_reload {
            note(self.reload_or_start("hitch"));
        }
        if restart.varnish_reload && self.settings.cache_type != CacheType::Varnish {
            note(self.reload_or_start("varnish"));
        }
        if restart.ntpd_restart {
            note(self.manager.restart("ntpd"));
        }
        if restart.sysctl_reload {
            note(self.sysctl_reload());
        }
        failures
    }

    fn ensure_started(&self, service: &str, restart: bool) -> Result<(), ServiceError> {
        match self.manager.status(service)? {
            ServiceState::Running if restart => self.manager.restart(service),
            ServiceState::Running => {
                debug!("{} already running", service);
                Ok(())
            }
            _ => self.manager.start(service),
        }
    }

    fn reload_or_start(&self, service: &str) -> Result<(), ServiceError> {
        match self.manager.status(service)? {
            ServiceState::Stopped => self.manager.start(service),
            _ => self.manager.reload(service),
        }
    }

    fn sysctl_reload(&self) -> Result<(), ServiceError> {
        let sysctl_err = |reason| ServiceError::Command {
            service: "sysctl".to_string(),
            action: "reload".to_string(),
            reason,
        };
        let out = self
            .runner
            .run("sysctl", &["-p"])
            .map_err(|e| sysctl_err(e.to_string()))?;
        if !out.success() {
            return Err(sysctl_err(out.reason()));
        }
        info!("sysctl settings reloaded");
        Ok(())
    }

    /// Bump remap.config's mtime so the cache engine re-reads it
    pub fn touch(&self, path: &Path) -> Result<(), ServiceError> {
        let touch_err = |reason| ServiceError::Command {
            service: path.display().to_string(),
            action: "touch".to_string(),
            reason,
        };
        let target = path.to_string_lossy();
        let out = self
            .runner
            .run("touch", &[target.as_ref()])
            .map_err(|e| touch_err(e.to_string()))?;
        if !out.success() {
            return Err(touch_err(out.reason()));
        }
        Ok(())
    }

    /// Enable at boot every service flagged "on" for some run level
    pub fn enable_boot_services(&self, entries: &[ChkconfigEntry]) -> Result<(), ServiceError> {
        for entry in entries {
            let levels = entry.enabled_levels();
            if levels.is_empty() {
                debug!("{}: not enabled at any run level", entry.name);
                continue;
            }
            self.manager.enable(&entry.name, &levels)?;
            info!("{} enabled at boot ({})", entry.name, levels.concat());
        }
        Ok(())
    }
}
