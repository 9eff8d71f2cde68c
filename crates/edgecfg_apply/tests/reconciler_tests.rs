//! End-to-end runs against fake collaborators and a temporary node layout.

use edgecfg_apply::config::Config;
use edgecfg_apply::config_file::Ownership;
use edgecfg_apply::control_plane::FakeControlPlane;
use edgecfg_apply::exec::{CommandOutput, FakeCommandRunner};
use edgecfg_apply::generator::FakeGenerator;
use edgecfg_apply::lock::AppLock;
use edgecfg_apply::packages::FakePackageManager;
use edgecfg_apply::service_control::FakeReloadClassifier;
use edgecfg_apply::services::{FakeServiceManager, ServiceState};
use edgecfg_apply::update_status::UpdateStatus;
use edgecfg_apply::{Collaborators, Reconciler, RunOutcome};
use edgecfg_common::{
    ChkconfigEntry, ConfigFileRecord, ExitCode, PackageEntry, RunMode, ServiceNeeds,
    UpdateStatusRecord, UseGit, WaitForParents, METADATA_FILE_NAME,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Node {
    _dir: TempDir,
    root: PathBuf,
    control: FakeControlPlane,
    generator: FakeGenerator,
    packages: FakePackageManager,
    services: FakeServiceManager,
    classifier: FakeReloadClassifier,
    runner: FakeCommandRunner,
}

fn pending() -> UpdateStatusRecord {
    UpdateStatusRecord {
        status: "REPORTED".to_string(),
        update_pending: true,
        ..Default::default()
    }
}

impl Node {
    fn new(records: Vec<ConfigFileRecord>) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        fs::create_dir_all(root.join("etc/trafficserver")).unwrap();
        fs::create_dir_all(root.join("libexec/trafficserver")).unwrap();
        Node {
            _dir: dir,
            root,
            control: FakeControlPlane::new().with_status(pending()),
            generator: FakeGenerator::new(records),
            packages: FakePackageManager::new().with_installed("trafficserver", "9.2.3"),
            services: FakeServiceManager::new().with_state("trafficserver", ServiceState::Running),
            classifier: FakeReloadClassifier::new(ServiceNeeds::NeedsReload),
            runner: FakeCommandRunner::new(),
        }
    }

    fn config_dir(&self) -> PathBuf {
        self.root.join("etc/trafficserver")
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir().join(name)
    }

    fn record(&self, name: &str, body: &str) -> ConfigFileRecord {
        ConfigFileRecord::new(name, &self.config_dir().to_string_lossy(), body)
    }

    fn plugin(&self, name: &str) {
        fs::write(self.root.join("libexec/trafficserver").join(name), "").unwrap();
    }

    fn on_disk(&self, name: &str, body: &str) {
        let path = self.config_path(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    }

    fn config(&self, mode: RunMode) -> Config {
        let mut config = Config::default();
        let a = &mut config.apply;
        a.cache_host_name = "edge-01".to_string();
        a.ts_home = self.root.clone();
        a.status_dir = self.root.join("status");
        a.backup_dir = self.root.join("backups");
        a.lock_file = self.root.join("edgecfg-apply.lock");
        a.run_mode = mode;
        a.use_git = UseGit::No;
        a.check_user = false;
        a.dispersion_secs = 0;
        a.reval_wait_secs = 0;
        a.no_confirm_service_action = true;
        config
    }

    fn run_with(&self, mut config: Config) -> RunOutcome {
        config.apply_run_mode();
        let collaborators = Collaborators {
            control_plane: Box::new(self.control.clone()),
            generator: Box::new(self.generator.clone()),
            packages: Box::new(self.packages.clone()),
            services: Box::new(self.services.clone()),
            classifier: Box::new(self.classifier.clone()),
            runner: std::sync::Arc::new(self.runner.clone()),
        };
        Reconciler::new(config, collaborators)
            .with_ownership(Ownership::current())
            .run()
    }

    fn run(&self, mode: RunMode) -> RunOutcome {
        self.run_with(self.config(mode))
    }
}

fn traffic_ctl_reloads(node: &Node) -> usize {
    node.runner
        .calls()
        .iter()
        .filter(|c| c.ends_with("traffic_ctl config reload"))
        .count()
}

// ============================================================================
// Update flow
// ============================================================================

#[test]
fn test_plugin_change_restarts_and_clears_flag() {
    let mut node = Node::new(vec![]);
    node.plugin("header_rewrite.so");
    node.generator = FakeGenerator::new(vec![node.record(
        "plugin.config",
        "header_rewrite.so\n",
    )]);

    let outcome = node.run(RunMode::Syncds);

    assert_eq!(outcome.exit_code, ExitCode::Success);
    assert_eq!(outcome.update_status, UpdateStatus::Successful);
    assert_eq!(node.services.calls(), vec!["restart trafficserver"]);
    assert!(outcome.metadata.restarted_cache);
    assert!(outcome.metadata.unset_update_flag);
    assert!(outcome.metadata.succeeded);

    let updates = node.control.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].update_pending, Some(false));
    assert!(!node.control.current_status().update_pending);

    assert_eq!(
        fs::read_to_string(node.config_path("plugin.config")).unwrap(),
        "header_rewrite.so\n"
    );
    assert!(node.config_path(METADATA_FILE_NAME).exists());
    assert!(node.root.join("status/REPORTED").exists());
}

#[test]
fn test_second_run_changes_nothing() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![node.record("remap.config", "map /a /b\n")]);

    let first = node.run(RunMode::Syncds);
    assert_eq!(first.update_status, UpdateStatus::Successful);
    assert_eq!(traffic_ctl_reloads(&node), 1);
    let written = fs::metadata(node.config_path("remap.config"))
        .unwrap()
        .modified()
        .unwrap();

    // same snapshot, queued again
    node.control = FakeControlPlane::new().with_status(pending());
    node.services = FakeServiceManager::new().with_state("trafficserver", ServiceState::Running);
    node.runner = FakeCommandRunner::new();
    let second = node.run(RunMode::Syncds);

    assert_eq!(second.exit_code, ExitCode::Success);
    assert_eq!(second.update_status, UpdateStatus::NotNeeded);
    assert!(node.services.calls().is_empty());
    assert_eq!(traffic_ctl_reloads(&node), 0);
    assert!(node.runner.calls_matching("touch").is_empty());
    let after = fs::metadata(node.config_path("remap.config"))
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(written, after);
    // nothing changed but the flag was still up, so it is cleared
    assert!(second.metadata.unset_update_flag);
}

#[test]
fn test_comment_only_change_is_not_applied() {
    let mut node = Node::new(vec![]);
    node.on_disk("remap.config", "map /a /b\n");
    node.generator = FakeGenerator::new(vec![node.record(
        "remap.config",
        "# generated by the control plane\nmap   /a /b\n",
    )]);

    let outcome = node.run(RunMode::Syncds);

    assert_eq!(outcome.exit_code, ExitCode::Success);
    assert_eq!(outcome.update_status, UpdateStatus::NotNeeded);
    assert!(node.services.calls().is_empty());
    assert!(node.classifier.calls().is_empty());
    assert_eq!(traffic_ctl_reloads(&node), 0);
    assert_eq!(
        fs::read_to_string(node.config_path("remap.config")).unwrap(),
        "map /a /b\n"
    );
}

#[test]
fn test_restart_flags_fold_the_same_in_any_order() {
    let names = ["records.config", "remap.config", "hitch.conf"];
    let orders = [[0, 1, 2], [2, 1, 0], [1, 2, 0]];
    let mut seen = Vec::new();

    for order in orders {
        let mut node = Node::new(vec![]);
        node.classifier = FakeReloadClassifier::new(ServiceNeeds::NeedsNothing);
        let records = order
            .iter()
            .map(|&i| node.record(names[i], &format!("{} body\n", names[i])))
            .collect();
        node.generator = FakeGenerator::new(records);

        let outcome = node.run(RunMode::Syncds);
        assert_eq!(outcome.update_status, UpdateStatus::Successful);
        assert!(outcome.metadata.reloaded_cache);
        seen.push((node.services.calls(), traffic_ctl_reloads(&node)));
    }

    assert_eq!(seen[0], (vec!["start hitch".to_string()], 1));
    assert!(seen.iter().all(|s| *s == seen[0]));
}

// ============================================================================
// Parents
// ============================================================================

#[test]
fn test_pending_parents_defer_the_update() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![node.record("records.config", "CONFIG a INT 1\n")]);
    node.control = FakeControlPlane::new().with_status(UpdateStatusRecord {
        parent_pending: true,
        ..pending()
    });

    let mut config = node.config(RunMode::Syncds);
    config.apply.wait_for_parents = WaitForParents::True;
    let outcome = node.run_with(config);

    assert_eq!(outcome.exit_code, ExitCode::Success);
    assert_eq!(outcome.update_status, UpdateStatus::NotNeeded);
    assert!(!node.config_path("records.config").exists());
    assert!(node.control.updates().is_empty());
    // checked once, then again after waiting
    assert_eq!(node.control.status_queries(), 2);
}

#[test]
fn test_not_waiting_for_parents_applies() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![node.record("records.config", "CONFIG a INT 1\n")]);
    node.control = FakeControlPlane::new().with_status(UpdateStatusRecord {
        parent_pending: true,
        ..pending()
    });

    let mut config = node.config(RunMode::Syncds);
    config.apply.wait_for_parents = WaitForParents::False;
    let outcome = node.run_with(config);

    assert_eq!(outcome.update_status, UpdateStatus::Successful);
    assert!(node.config_path("records.config").exists());
    assert_eq!(node.control.updates().len(), 1);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_missing_plugin_fails_the_run_and_keeps_the_flag() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![
        node.record("plugin.config", "missing.so\n"),
        node.record("remap.config", "map /a /b\n"),
        node.record("records.config", "CONFIG a INT 1\n"),
    ]);

    let outcome = node.run(RunMode::Syncds);

    assert_eq!(outcome.exit_code, ExitCode::ConfigFilesError);
    assert_eq!(outcome.exit_code.as_i32(), 133);
    assert_eq!(outcome.update_status, UpdateStatus::Failed);
    assert!(!node.config_path("plugin.config").exists());
    // coupled with plugin.config
    assert!(!node.config_path("remap.config").exists());
    assert!(node.config_path("records.config").exists());
    assert!(node.control.updates().is_empty());
    assert!(node.control.current_status().update_pending);
    assert!(!outcome.metadata.succeeded);
    assert!(node.config_path(METADATA_FILE_NAME).exists());
}

#[test]
fn test_already_running() {
    let node = Node::new(vec![]);
    let lock_path = node.root.join("edgecfg-apply.lock");
    let _held = AppLock::try_acquire(&lock_path).unwrap().unwrap();

    let outcome = node.run(RunMode::Syncds);

    assert_eq!(outcome.exit_code, ExitCode::AlreadyRunning);
    assert_eq!(outcome.exit_code.as_i32(), 132);
    assert_eq!(node.control.status_queries(), 0);
    assert!(!node.config_path(METADATA_FILE_NAME).exists());
}

#[test]
fn test_control_plane_failure() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![node.record("records.config", "CONFIG a INT 1\n")]);
    node.control = FakeControlPlane::new().with_status_failure();

    let outcome = node.run(RunMode::Syncds);

    assert_eq!(outcome.exit_code, ExitCode::SyncError);
    assert_eq!(outcome.exit_code.as_i32(), 139);
    assert!(!node.config_path("records.config").exists());
}

#[test]
fn test_failed_restart_leaves_the_flag() {
    let mut node = Node::new(vec![]);
    node.plugin("header_rewrite.so");
    node.generator = FakeGenerator::new(vec![node.record("plugin.config", "header_rewrite.so\n")]);
    node.services = FakeServiceManager::new()
        .with_state("trafficserver", ServiceState::Running)
        .with_failing("restart", "trafficserver");

    let outcome = node.run(RunMode::Syncds);

    assert_eq!(outcome.exit_code, ExitCode::ServicesError);
    assert!(outcome.metadata.partial_success);
    assert!(node.control.updates().is_empty());
}

#[test]
fn test_failed_report_upstream() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![node.record("records.config", "CONFIG a INT 1\n")]);
    node.control = FakeControlPlane::new()
        .with_status(pending())
        .with_update_failure();

    let outcome = node.run(RunMode::Syncds);

    assert_eq!(outcome.exit_code, ExitCode::SyncError);
    assert_eq!(outcome.update_status, UpdateStatus::Successful);
    assert!(node.config_path("records.config").exists());
    assert!(!outcome.metadata.unset_update_flag);
    assert!(node.control.current_status().update_pending);
}

#[test]
fn test_generator_failure() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![]).with_failure();

    let outcome = node.run(RunMode::Syncds);

    assert_eq!(outcome.exit_code, ExitCode::ConfigFilesError);
    assert_eq!(outcome.update_status, UpdateStatus::Failed);
    assert!(node.control.updates().is_empty());
}

// ============================================================================
// Modes
// ============================================================================

#[test]
fn test_badass_replaces_packages_before_installing() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![node.record("records.config", "CONFIG a INT 1\n")]);
    node.packages = FakePackageManager::new()
        .with_installed("trafficserver", "9.2.3")
        .with_installed("A", "1.0")
        .with_installed("B", "3.1")
        .with_requires("A-1.0", "B-3.1");
    node.control = FakeControlPlane::new()
        .with_status(UpdateStatusRecord {
            status: "REPORTED".to_string(),
            ..Default::default()
        })
        .with_packages(vec![
            PackageEntry::new("trafficserver", "9.2.3"),
            PackageEntry::new("A", "2.0"),
        ]);

    let outcome = node.run(RunMode::Badass);

    assert_eq!(outcome.exit_code, ExitCode::Success);
    let ops = node.packages.ops();
    let last_remove = ops.iter().rposition(|o| o.starts_with("remove")).unwrap();
    let first_install = ops.iter().position(|o| o.starts_with("install")).unwrap();
    assert!(last_remove < first_install);
    assert_eq!(ops.last().map(String::as_str), Some("install A-2.0"));
    assert!(outcome
        .metadata
        .installed_packages
        .contains(&"A-2.0".to_string()));
    // badass always restarts
    assert_eq!(node.services.calls(), vec!["restart trafficserver"]);
}

#[test]
fn test_revalidate_only_writes_the_revalidation_file() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![
        node.record("remap.config", "map /a /b\n"),
        node.record("regex_revalidate.config", "http://a/.* 1700000000\n"),
    ]);
    node.control = FakeControlPlane::new().with_status(UpdateStatusRecord {
        status: "REPORTED".to_string(),
        reval_pending: true,
        use_reval_pending: true,
        ..Default::default()
    });

    let outcome = node.run(RunMode::Revalidate);

    assert_eq!(outcome.exit_code, ExitCode::Success);
    assert!(node.config_path("regex_revalidate.config").exists());
    assert!(!node.config_path("remap.config").exists());
    let updates = node.control.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].reval_pending, Some(false));
    assert_eq!(updates[0].update_pending, None);
    assert!(outcome.metadata.unset_reval_flag);
    assert!(node.packages.ops().is_empty());
}

#[test]
fn test_report_mode_changes_nothing() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![node.record("records.config", "CONFIG a INT 1\n")]);
    node.runner = FakeCommandRunner::new()
        .with_response("git", CommandOutput::fail(1, "git must not run in report mode"));

    let outcome = node.run(RunMode::Report);

    assert_eq!(outcome.exit_code, ExitCode::Success);
    assert_eq!(outcome.update_status, UpdateStatus::Needed);
    assert!(!node.config_path("records.config").exists());
    assert!(!node.config_path(METADATA_FILE_NAME).exists());
    assert!(!node.root.join("status").exists());
    assert!(node.services.calls().is_empty());
    assert!(node.control.updates().is_empty());
    assert!(node.runner.calls_matching("git").is_empty());
}

#[test]
fn test_idle_syncds_runs_pending_revalidation() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![
        node.record("records.config", "CONFIG a INT 1\n"),
        node.record("regex_revalidate.config", "http://a/.* 1700000000\n"),
    ]);
    node.control = FakeControlPlane::new().with_status(UpdateStatusRecord {
        status: "REPORTED".to_string(),
        reval_pending: true,
        use_reval_pending: true,
        ..Default::default()
    });

    let outcome = node.run(RunMode::Syncds);

    assert_eq!(outcome.exit_code, ExitCode::Success);
    assert!(node.config_path("regex_revalidate.config").exists());
    assert!(!node.config_path("records.config").exists());
    assert!(outcome.metadata.unset_reval_flag);
    assert!(!outcome.metadata.unset_update_flag);
}

#[test]
fn test_metadata_keeps_files_owned_by_earlier_runs() {
    let mut node = Node::new(vec![]);
    node.generator = FakeGenerator::new(vec![node.record("records.config", "CONFIG a INT 1\n")]);
    node.run(RunMode::Syncds);

    node.control = FakeControlPlane::new().with_status(pending());
    node.generator.set_records(vec![node.record("ssl_multicert.config", "dest_ip=* ssl_cert_name=edge.cer\n")]);
    let outcome = node.run(RunMode::Syncds);

    let owned = &outcome.metadata.owned_files;
    let path = |name: &str| node.config_path(name).to_string_lossy().to_string();
    assert!(owned.contains(&path("records.config")));
    assert!(owned.contains(&path("ssl_multicert.config")));
    assert!(Path::new(&path(METADATA_FILE_NAME)).exists());
}

#[test]
fn test_badass_enables_boot_services() {
    let mut node = Node::new(vec![]);
    node.control = FakeControlPlane::new()
        .with_status(pending())
        .with_packages(vec![PackageEntry::new("trafficserver", "9.2.3")])
        .with_chkconfig(vec![
            ChkconfigEntry {
                name: "trafficserver".to_string(),
                value: "0:off 1:off 2:on 3:on 4:on 5:on 6:off".to_string(),
            },
            ChkconfigEntry {
                name: "postfix".to_string(),
                value: "0:off 1:off 2:off 3:off 4:off 5:off 6:off".to_string(),
            },
        ]);

    let outcome = node.run(RunMode::Badass);

    assert_eq!(outcome.exit_code, ExitCode::Success);
    let calls = node.services.calls();
    assert!(calls.contains(&"enable trafficserver".to_string()));
    assert!(!calls.iter().any(|c| c.ends_with("postfix")));
}
