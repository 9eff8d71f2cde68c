//! Service Management v1.0
//!
//! Host service control behind one trait:
//! - `SystemdServiceManager` (systemctl)
//! - `SysVServiceManager` (service / chkconfig)
//! - `FakeServiceManager` for tests
//!
//! The implementation is picked once per run by `probe_service_management`.

use crate::error::ServiceError;
use crate::exec::{CommandOutput, CommandRunner};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Directory that exists only when systemd is PID 1
pub const SYSTEMD_MARKER: &str = "/run/systemd/system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    Unknown,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Unknown => "unknown",
        }
    }
}

// ============================================================================
// Service Manager Trait
// ============================================================================

pub trait ServiceManager: Send + Sync {
    fn status(&self, service: &str) -> Result<ServiceState, ServiceError>;

    fn start(&self, service: &str) -> Result<(), ServiceError>;

    fn stop(&self, service: &str) -> Result<(), ServiceError>;

    fn restart(&self, service: &str) -> Result<(), ServiceError>;

    fn reload(&self, service: &str) -> Result<(), ServiceError>;

    /// Enable at boot for the given SysV run levels (systemd ignores levels)
    fn enable(&self, service: &str, levels: &[String]) -> Result<(), ServiceError>;

    fn name(&self) -> &'static str;
}

fn check(service: &str, action: &str, result: std::io::Result<CommandOutput>) -> Result<(), ServiceError> {
    let out = result.map_err(|e| ServiceError::Command {
        service: service.to_string(),
        action: action.to_string(),
        reason: e.to_string(),
    })?;
    if !out.success() {
        return Err(ServiceError::Command {
            service: service.to_string(),
            action: action.to_string(),
            reason: out.reason(),
        });
    }
    info!("{} {}: ok", action, service);
    Ok(())
}

// ============================================================================
// systemd
// ============================================================================

pub struct SystemdServiceManager {
    runner: Arc<dyn CommandRunner>,
}

impl SystemdServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn systemctl(&self, action: &str, service: &str) -> Result<(), ServiceError> {
        check(service, action, self.runner.run("systemctl", &[action, service]))
    }
}

impl ServiceManager for SystemdServiceManager {
    fn status(&self, service: &str) -> Result<ServiceState, ServiceError> {
        // is-active exits non-zero for inactive units, so only stdout matters
        let out = self
            .runner
            .run("systemctl", &["is-active", service])
            .map_err(|e| ServiceError::Command {
                service: service.to_string(),
                action: "status".to_string(),
                reason: e.to_string(),
            })?;
        let state = match out.stdout.trim() {
            "active" | "reloading" | "activating" => ServiceState::Running,
            "inactive" | "failed" | "deactivating" => ServiceState::Stopped,
            _ => ServiceState::Unknown,
        };
        debug!("{} is {}", service, state.as_str());
        Ok(state)
    }

    fn start(&self, service: &str) -> Result<(), ServiceError> {
        self.systemctl("start", service)
    }

    fn stop(&self, service: &str) -> Result<(), ServiceError> {
        self.systemctl("stop", service)
    }

    fn restart(&self, service: &str) -> Result<(), ServiceError> {
        self.systemctl("restart", service)
    }

    fn reload(&self, service: &str) -> Result<(), ServiceError> {
        self.systemctl("reload", service)
    }

    fn enable(&self, service: &str, _levels: &[String]) -> Result<(), ServiceError> {
        self.systemctl("enable", service)
    }

    fn name(&self) -> &'static str {
        "systemd"
    }
}

// ============================================================================
// SysV init
// ============================================================================

pub struct SysVServiceManager {
    runner: Arc<dyn CommandRunner>,
}

impl SysVServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn service(&self, action: &str, service: &str) -> Result<(), ServiceError> {
        check(service, action, self.runner.run("service", &[service, action]))
    }
}

impl ServiceManager for SysVServiceManager {
    fn status(&self, service: &str) -> Result<ServiceState, ServiceError> {
        let out = self
            .runner
            .run("service", &[service, "status"])
            .map_err(|e| ServiceError::Command {
                service: service.to_string(),
                action: "status".to_string(),
                reason: e.to_string(),
            })?;
        // LSB: 0 running, 3 not running
        Ok(match out.code {
            0 => ServiceState::Running,
            3 => ServiceState::Stopped,
            _ => ServiceState::Unknown,
        })
    }

    fn start(&self, service: &str) -> Result<(), ServiceError> {
        self.service("start", service)
    }

    fn stop(&self, service: &str) -> Result<(), ServiceError> {
        self.service("stop", service)
    }

    fn restart(&self, service: &str) -> Result<(), ServiceError> {
        self.service("restart", service)
    }

    fn reload(&self, service: &str) -> Result<(), ServiceError> {
        self.service("reload", service)
    }

    fn enable(&self, service: &str, levels: &[String]) -> Result<(), ServiceError> {
        let levels = levels.concat();
        let mut args = vec![];
        if !levels.is_empty() {
            args.push("--level");
            args.push(levels.as_str());
        }
        args.push(service);
        args.push("on");
        check(service, "enable", self.runner.run("chkconfig", &args))
    }

    fn name(&self) -> &'static str {
        "sysv"
    }
}

/// Pick the service manager for this host
pub fn probe_service_management(
    runner: Arc<dyn CommandRunner>,
    systemd_marker: &Path,
) -> Box<dyn ServiceManager> {
    if systemd_marker.is_dir() {
        debug!("service management: systemd");
        Box::new(SystemdServiceManager::new(runner))
    } else {
        debug!("service management: sysv");
        Box::new(SysVServiceManager::new(runner))
    }
}

// ============================================================================
// Fake Service Manager (Testing)
// ============================================================================

#[derive(Debug, Default)]
struct FakeServiceState {
    states: HashMap<String, ServiceState>,
    failing: HashSet<String>,
    calls: Vec<String>,
}

/// Records calls as "<action> <service>". Unknown services report `Stopped`.
#[derive(Debug, Clone, Default)]
pub struct FakeServiceManager {
    state: Arc<Mutex<FakeServiceState>>,
}

impl FakeServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(self, service: &str, state: ServiceState) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.states.insert(service.to_string(), state);
        }
        self
    }

    /// `action` on `service` fails, e.g. ("restart", "trafficserver")
    pub fn with_failing(self, action: &str, service: &str) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.failing.insert(format!("{} {}", action, service));
        }
        self
    }

    /// Mutating calls only (status queries are not recorded)
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    fn act(&self, action: &str, service: &str, after: Option<ServiceState>) -> Result<(), ServiceError> {
        let mut s = self.state.lock().map_err(|_| ServiceError::NoServiceManager)?;
        let call = format!("{} {}", action, service);
        s.calls.push(call.clone());
        if s.failing.contains(&call) {
            return Err(ServiceError::Command {
                service: service.to_string(),
                action: action.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        if let Some(state) = after {
            s.states.insert(service.to_string(), state);
        }
        Ok(())
    }
}

impl ServiceManager for FakeServiceManager {
    fn status(&self, service: &str) -> Result<ServiceState, ServiceError> {
        let s = self.state.lock().map_err(|_| ServiceError::NoServiceManager)?;
        Ok(s.states.get(service).copied().unwrap_or(ServiceState::Stopped))
    }

    fn start(&self, service: &str) -> Result<(), ServiceError> {
        self.act("start", service, Some(ServiceState::Running))
    }

    fn stop(&self, service: &str) -> Result<(), ServiceError> {
        self.act("stop", service, Some(ServiceState::Stopped))
    }

    fn restart(&self, service: &str) -> Result<(), ServiceError> {
        self.act("restart", service, Some(ServiceState::Running))
    }

    fn reload(&self, service: &str) -> Result<(), ServiceError> {
        self.act("reload", service, None)
    }

    fn enable(&self, service: &str, _levels: &[String]) -> Result<(), ServiceError> {
        self.act("enable", service, None)
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
