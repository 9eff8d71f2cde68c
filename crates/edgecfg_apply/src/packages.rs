//! Package Reconciler v1.0
//!
//! Brings the installed package set in line with the manifest:
//! - a package at the wanted version is kept
//! - a missing package is installed
//! - a package at another version is removed together with everything
//!   that requires it, then the wanted version is installed
//!
//! Every install is checked for availability before anything is touched,
//! and all removals run before any install.

use crate::error::PackageError;
use crate::exec::CommandRunner;
use edgecfg_common::PackageEntry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

// ============================================================================
// Package Manager Trait
// ============================================================================

/// Host package database and installer
pub trait PackageManager: Send + Sync {
    /// Installed full names ("name-version") for a package name, empty when absent
    fn query(&self, name: &str) -> Result<Vec<String>, PackageError>;

    /// Installed packages that require `full_name`
    fn what_requires(&self, full_name: &str) -> Result<Vec<String>, PackageError>;

    /// Whether `full_name` can be installed from a configured repository
    fn is_available(&self, full_name: &str) -> Result<bool, PackageError>;

    fn install(&self, full_name: &str) -> Result<(), PackageError>;

    fn remove(&self, full_name: &str) -> Result<(), PackageError>;
}

// ============================================================================
// RPM / Yum (Production)
// ============================================================================

pub struct RpmPackageManager {
    runner: Arc<dyn CommandRunner>,
}

impl RpmPackageManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn lines(stdout: &str) -> Vec<String> {
        stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl PackageManager for RpmPackageManager {
    fn query(&self, name: &str) -> Result<Vec<String>, PackageError> {
        let out = self
            .runner
            .run("rpm", &["-q", name])
            .map_err(|e| PackageError::Query {
                package: name.to_string(),
                reason: e.to_string(),
            })?;
        // rpm exits 1 with "package x is not installed"
        if !out.success() {
            return Ok(Vec::new());
        }
        Ok(Self::lines(&out.stdout))
    }

    fn what_requires(&self, full_name: &str) -> Result<Vec<String>, PackageError> {
        let out = self
            .runner
            .run("rpm", &["-q", "--whatrequires", full_name])
            .map_err(|e| PackageError::Query {
                package: full_name.to_string(),
                reason: e.to_string(),
            })?;
        // "no package requires x" also exits 1
        if !out.success() {
            return Ok(Vec::new());
        }
        Ok(Self::lines(&out.stdout))
    }

    fn is_available(&self, full_name: &str) -> Result<bool, PackageError> {
        let out = self
            .runner
            .run("yum", &["info", full_name])
            .map_err(|e| PackageError::Query {
                package: full_name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(out.success())
    }

    fn install(&self, full_name: &str) -> Result<(), PackageError> {
        let install_err = |reason| PackageError::Install {
            package: full_name.to_string(),
            reason,
        };
        let out = self
            .runner
            .run("yum", &["install", "-y", full_name])
            .map_err(|e| install_err(e.to_string()))?;
        if !out.success() {
            return Err(install_err(out.reason()));
        }
        Ok(())
    }

    fn remove(&self, full_name: &str) -> Result<(), PackageError> {
        let remove_err = |reason| PackageError::Remove {
            package: full_name.to_string(),
            reason,
        };
        let out = self
            .runner
            .run("rpm", &["-e", "--nodeps", full_name])
            .map_err(|e| remove_err(e.to_string()))?;
        if !out.success() {
            return Err(remove_err(out.reason()));
        }
        Ok(())
    }
}

// ============================================================================
// Fake Package Manager (Testing)
// ============================================================================

#[derive(Debug, Default)]
struct FakePackageState {
    /// name -> installed full names
    installed: BTreeMap<String, Vec<String>>,
    requires: HashMap<String, Vec<String>>,
    unavailable: HashSet<String>,
    failing: HashSet<String>,
    ops: Vec<String>,
    queries: usize,
}

/// In-memory package database. Records every mutation as "install x" / "remove x".
#[derive(Debug, Clone, Default)]
pub struct FakePackageManager {
    state: Arc<Mutex<FakePackageState>>,
}

impl FakePackageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_installed(self, name: &str, version: &str) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.installed
                .entry(name.to_string())
                .or_default()
                .push(format!("{}-{}", name, version));
        }
        self
    }

    /// `dependent` requires `full_name`
    pub fn with_requires(self, full_name: &str, dependent: &str) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.requires
                .entry(full_name.to_string())
                .or_default()
                .push(dependent.to_string());
        }
        self
    }

    pub fn with_unavailable(self, full_name: &str) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.unavailable.insert(full_name.to_string());
        }
        self
    }

    /// Installing `full_name` fails
    pub fn with_failing(self, full_name: &str) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.failing.insert(full_name.to_string());
        }
        self
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().map(|s| s.ops.clone()).unwrap_or_default()
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().map(|s| s.queries).unwrap_or(0)
    }

    pub fn installed(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .map(|s| s.installed.values().flatten().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned(package: &str) -> PackageError {
    PackageError::Query {
        package: package.to_string(),
        reason: "fake state poisoned".to_string(),
    }
}

impl PackageManager for FakePackageManager {
    fn query(&self, name: &str) -> Result<Vec<String>, PackageError> {
        let mut s = self.state.lock().map_err(|_| poisoned(name))?;
        s.queries += 1;
        Ok(s.installed.get(name).cloned().unwrap_or_default())
    }

    fn what_requires(&self, full_name: &str) -> Result<Vec<String>, PackageError> {
        let s = self.state.lock().map_err(|_| poisoned(full_name))?;
        Ok(s.requires.get(full_name).cloned().unwrap_or_default())
    }

    fn is_available(&self, full_name: &str) -> Result<bool, PackageError> {
        let s = self.state.lock().map_err(|_| poisoned(full_name))?;
        Ok(!s.unavailable.contains(full_name))
    }

    fn install(&self, full_name: &str) -> Result<(), PackageError> {
        let mut s = self.state.lock().map_err(|_| poisoned(full_name))?;
        s.ops.push(format!("install {}", full_name));
        if s.failing.contains(full_name) {
            return Err(PackageError::Install {
                package: full_name.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        let name = full_name
            .rsplit_once('-')
            .map(|(n, _)| n)
            .unwrap_or(full_name)
            .to_string();
        s.installed.entry(name).or_default().push(full_name.to_string());
        Ok(())
    }

    fn remove(&self, full_name: &str) -> Result<(), PackageError> {
        let mut s = self.state.lock().map_err(|_| poisoned(full_name))?;
        s.ops.push(format!("remove {}", full_name));
        for fulls in s.installed.values_mut() {
            fulls.retain(|f| f != full_name);
        }
        Ok(())
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Actions needed to match the manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackagePlan {
    pub keep: Vec<String>,
    pub uninstall: Vec<String>,
    pub install: Vec<String>,
}

impl PackagePlan {
    pub fn is_noop(&self) -> bool {
        self.uninstall.is_empty() && self.install.is_empty()
    }

    fn describe(&self) -> Vec<String> {
        self.uninstall
            .iter()
            .map(|p| format!("remove {}", p))
            .chain(self.install.iter().map(|p| format!("install {}", p)))
            .collect()
    }
}

pub struct PackageReconciler {
    manager: Box<dyn PackageManager>,
    install_enabled: bool,
    /// package name -> any version installed, for this run only
    cache: HashMap<String, bool>,
    installed_this_run: Vec<String>,
}

impl PackageReconciler {
    pub fn new(manager: Box<dyn PackageManager>, install_enabled: bool) -> Self {
        Self {
            manager,
            install_enabled,
            cache: HashMap::new(),
            installed_this_run: Vec::new(),
        }
    }

    /// Whether any version of `name` is installed. Cached for the run.
    pub fn is_installed(&mut self, name: &str) -> bool {
        if let Some(installed) = self.cache.get(name) {
            return *installed;
        }
        let installed = match self.manager.query(name) {
            Ok(found) => !found.is_empty(),
            Err(e) => {
                error!("{}", e);
                false
            }
        };
        self.cache.insert(name.to_string(), installed);
        installed
    }

    /// Packages installed by this run
    pub fn installed_this_run(&self) -> &[String] {
        &self.installed_this_run
    }

    /// Work out what to change, without changing anything
    pub fn plan(&mut self, desired: &[PackageEntry]) -> Result<PackagePlan, PackageError> {
        let mut plan = PackagePlan::default();
        let mut removing: BTreeSet<String> = BTreeSet::new();

        for entry in desired {
            let wanted = entry.full_name();
            let found = self.manager.query(&entry.name)?;
            self.cache.insert(entry.name.clone(), !found.is_empty());

            if found.iter().any(|f| *f == wanted) {
                debug!("{} already installed", wanted);
                plan.keep.push(wanted);
                continue;
            }
            for stale in found {
                info!("{} installed, {} wanted", stale, wanted);
                for dependent in self.manager.what_requires(&stale)? {
                    if removing.insert(dependent.clone()) {
                        plan.uninstall.push(dependent);
                    }
                }
                if removing.insert(stale.clone()) {
                    plan.uninstall.push(stale);
                }
            }
            plan.install.push(wanted);
        }

        // a kept package that is also a removed dependent has to come back
        let (reinstall, keep): (Vec<String>, Vec<String>) =
            plan.keep.into_iter().partition(|k| removing.contains(k));
        plan.keep = keep;
        plan.install.extend(reinstall);
        Ok(plan)
    }

    /// Converge the installed set. Returns desired full name -> installed.
    pub fn reconcile(
        &mut self,
        desired: &[PackageEntry],
    ) -> Result<BTreeMap<String, bool>, PackageError> {
        let plan = self.plan(desired)?;

        let mut result: BTreeMap<String, bool> =
            plan.keep.iter().map(|p| (p.clone(), true)).collect();

        if plan.is_noop() {
            info!("all {} packages at the wanted version", plan.keep.len());
            return Ok(result);
        }
        if !self.install_enabled {
            return Err(PackageError::Mismatch(plan.describe()));
        }

        for package in &plan.install {
            if !self.manager.is_available(package)? {
                return Err(PackageError::Unavailable(package.clone()));
            }
        }

        let names: HashMap<String, &str> = desired
            .iter()
            .map(|e| (e.full_name(), e.name.as_str()))
            .collect();

        for package in &plan.uninstall {
            info!("removing {}", package);
            self.manager.remove(package)?;
            // dependents carry no bare name, so drop every name the full name could belong to
            self.cache
                .retain(|name, _| !package.starts_with(&format!("{}-", name)));
        }
        for package in &plan.install {
            info!("installing {}", package);
            self.manager.install(package)?;
            if let Some(name) = names.get(package) {
                self.cache.insert(name.to_string(), true);
            }
            self.installed_this_run.push(package.clone());
            result.insert(package.clone(), true);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, FakeCommandRunner};

    fn entry(name: &str, version: &str) -> PackageEntry {
        PackageEntry::new(name, version)
    }

    #[test]
    fn test_keep_and_install() {
        let fake = FakePackageManager::new().with_installed("trafficserver", "9.2.1");
        let view = fake.clone();
        let mut rec = PackageReconciler::new(Box::new(fake), true);

        let result = rec
            .reconcile(&[entry("trafficserver", "9.2.1"), entry("hitch", "1.7")])
            .unwrap();
        assert_eq!(result.get("trafficserver-9.2.1"), Some(&true));
        assert_eq!(result.get("hitch-1.7"), Some(&true));
        assert_eq!(view.ops(), vec!["install hitch-1.7"]);
        assert_eq!(rec.installed_this_run(), &["hitch-1.7".to_string()]);
    }

    #[test]
    fn test_removals_before_installs() {
        let fake = FakePackageManager::new()
            .with_installed("A", "1.0")
            .with_installed("B", "3.1")
            .with_requires("A-1.0", "B-3.1");
        let view = fake.clone();
        let mut rec = PackageReconciler::new(Box::new(fake), true);

        rec.reconcile(&[entry("A", "2.0")]).unwrap();
        let ops = view.ops();
        assert_eq!(ops.len(), 3);
        let last_remove = ops.iter().rposition(|o| o.starts_with("remove")).unwrap();
        let first_install = ops.iter().position(|o| o.starts_with("install")).unwrap();
        assert!(last_remove < first_install);
        assert!(ops.contains(&"remove A-1.0".to_string()));
        assert!(ops.contains(&"remove B-3.1".to_string()));
        assert_eq!(ops[2], "install A-2.0");
    }

    #[test]
    fn test_removed_dependent_in_manifest_is_reinstalled() {
        let fake = FakePackageManager::new()
            .with_installed("A", "1.0")
            .with_installed("B", "3.1")
            .with_requires("A-1.0", "B-3.1");
        let mut rec = PackageReconciler::new(Box::new(fake), true);
        let plan = rec.plan(&[entry("B", "3.1"), entry("A", "2.0")]).unwrap();
        assert!(plan.keep.is_empty());
        assert_eq!(plan.install, vec!["A-2.0", "B-3.1"]);
    }

    #[test]
    fn test_unavailable_aborts_before_changes() {
        let fake = FakePackageManager::new()
            .with_installed("A", "1.0")
            .with_unavailable("A-2.0");
        let view = fake.clone();
        let mut rec = PackageReconciler::new(Box::new(fake), true);
        let err = rec.reconcile(&[entry("A", "2.0")]).unwrap_err();
        assert!(matches!(err, PackageError::Unavailable(p) if p == "A-2.0"));
        assert!(view.ops().is_empty());
    }

    #[test]
    fn test_install_disabled_reports_mismatch() {
        let fake = FakePackageManager::new().with_installed("A", "1.0");
        let view = fake.clone();
        let mut rec = PackageReconciler::new(Box::new(fake), false);
        let err = rec.reconcile(&[entry("A", "2.0")]).unwrap_err();
        match err {
            PackageError::Mismatch(items) => {
                assert_eq!(items, vec!["remove A-1.0", "install A-2.0"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(view.ops().is_empty());
    }

    #[test]
    fn test_install_failure_propagates() {
        let fake = FakePackageManager::new().with_failing("A-2.0");
        let mut rec = PackageReconciler::new(Box::new(fake), true);
        assert!(matches!(
            rec.reconcile(&[entry("A", "2.0")]),
            Err(PackageError::Install { .. })
        ));
    }

    #[test]
    fn test_is_installed_uses_cache() {
        let fake = FakePackageManager::new().with_installed("trafficserver", "9.2.1");
        let view = fake.clone();
        let mut rec = PackageReconciler::new(Box::new(fake), true);
        rec.reconcile(&[entry("trafficserver", "9.2.1")]).unwrap();
        let before = view.query_count();

        assert!(rec.is_installed("trafficserver"));
        assert_eq!(view.query_count(), before);

        assert!(!rec.is_installed("teakd"));
        assert!(!rec.is_installed("teakd"));
        assert_eq!(view.query_count(), before + 1);
    }

    #[test]
    fn test_fresh_install_is_installed() {
        let fake = FakePackageManager::new().with_installed("trafficserver_plugins", "2.0");
        let mut rec = PackageReconciler::new(Box::new(fake), true);
        rec.reconcile(&[entry("trafficserver", "9.2.3")]).unwrap();
        for _ in 0..20 {
            assert!(rec.is_installed("trafficserver"));
        }
    }

    #[test]
    fn test_upgrade_is_installed() {
        let fake = FakePackageManager::new()
            .with_installed("trafficserver", "9.2.1")
            .with_installed("trafficserver_plugins", "2.0")
            .with_requires("trafficserver-9.2.1", "trafficserver_plugins-2.0");
        let mut rec = PackageReconciler::new(Box::new(fake), true);
        rec.reconcile(&[entry("trafficserver", "9.2.3")]).unwrap();
        for _ in 0..20 {
            assert!(rec.is_installed("trafficserver"));
        }
        assert!(!rec.is_installed("trafficserver_plugins"));
    }

    #[test]
    fn test_is_installed_matches_whole_name() {
        let fake = FakePackageManager::new().with_installed("trafficserver_plugins", "2.0");
        let mut rec = PackageReconciler::new(Box::new(fake), true);
        assert!(rec.is_installed("trafficserver_plugins"));
        assert!(!rec.is_installed("trafficserver"));
    }

    #[test]
    fn test_rpm_manager_commands() {
        let runner = FakeCommandRunner::new()
            .with_response("rpm -q trafficserver", CommandOutput::ok("trafficserver-9.2.1\n"))
            .with_response("rpm -q hitch", CommandOutput::fail(1, "package hitch is not installed"))
            .with_response("yum info nope-1.0", CommandOutput::fail(1, "No matching Packages"))
            .with_response("yum install -y bad-1.0", CommandOutput::fail(1, "conflict"));
        let view = runner.clone();
        let rpm = RpmPackageManager::new(Arc::new(runner));

        assert_eq!(rpm.query("trafficserver").unwrap(), vec!["trafficserver-9.2.1"]);
        assert!(rpm.query("hitch").unwrap().is_empty());
        assert!(rpm.what_requires("trafficserver-9.2.1").unwrap().is_empty());
        assert!(!rpm.is_available("nope-1.0").unwrap());
        assert!(rpm.is_available("hitch-1.7").unwrap());
        assert!(rpm.remove("old-1.0").is_ok());
        let err = rpm.install("bad-1.0").unwrap_err();
        assert!(err.to_string().contains("conflict"));
        assert!(view.calls().contains(&"rpm -e --nodeps old-1.0".to_string()));
    }
}
