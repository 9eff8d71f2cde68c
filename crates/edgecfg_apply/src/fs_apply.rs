//! File System Applier v1.0
//!
//! Replaces one config file on disk. The body always goes to `<path>.tmp`
//! first, gets its mode and owner, and is then renamed over the live file,
//! so a crash leaves either the old file or the new one and never a
//! truncated mix.

use crate::config_file::ConfigFile;
use crate::error::ApplyError;
use crate::restart::{classify_file, RestartData};
use edgecfg_common::{ApplyFiles, RunMode};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// The only file a revalidate-scoped run may write
pub const REVAL_FILE: &str = "regex_revalidate.config";

/// Access rules; syncds runs leave it alone unless told otherwise
pub const IP_ALLOW_FILE: &str = "ip_allow.config";

/// What this run is allowed to write
#[derive(Debug, Clone, Copy)]
pub struct ApplyScope {
    pub run_mode: RunMode,
    pub files: ApplyFiles,
    pub report_only: bool,
    pub sync_ds_updates_ip_allow: bool,
}

pub struct FileSystemApplier {
    scope: ApplyScope,
    config_dir: PathBuf,
}

impl FileSystemApplier {
    pub fn new(scope: ApplyScope, config_dir: PathBuf) -> Self {
        Self { scope, config_dir }
    }

    /// Whether the run scope covers this file
    pub fn in_scope(&self, file: &ConfigFile) -> bool {
        if self.scope.files == ApplyFiles::Reval && file.name != REVAL_FILE {
            return false;
        }
        if file.name == IP_ALLOW_FILE
            && self.scope.run_mode == RunMode::Syncds
            && !self.scope.sync_ds_updates_ip_allow
        {
            return false;
        }
        true
    }

    /// Write a changed file into place and report what it disrupts
    pub fn apply(&self, file: &mut ConfigFile) -> Result<RestartData, ApplyError> {
        if self.scope.report_only {
            debug!("{}: report only, not writing", file.name);
            return Ok(RestartData::NONE);
        }
        if !self.in_scope(file) {
            if file.audit.change_needed {
                info!("{}: changed but outside this run's scope, skipping", file.name);
            }
            return Ok(RestartData::NONE);
        }
        if !file.audit.complete || file.audit.failed {
            return Err(ApplyError::NotAudited {
                file: file.name.clone(),
            });
        }
        if !file.audit.change_needed {
            return Ok(RestartData::NONE);
        }

        backup_current(file);
        write_temp(file)?;
        commit_temp(file)?;
        file.audit.change_applied = true;

        let restart = classify_file(file, &self.config_dir);
        info!("{}: applied", file.path.display());
        debug!("{}: restart data {:?}", file.name, restart);
        Ok(restart)
    }
}

/// Keep the previous version next to the other backups. Best effort.
fn backup_current(file: &ConfigFile) {
    if !file.path.exists() {
        return;
    }
    let result = file
        .backup_path
        .parent()
        .map(fs::create_dir_all)
        .unwrap_or(Ok(()))
        .and_then(|_| fs::copy(&file.path, &file.backup_path));
    if let Err(e) = result {
        warn!(
            "{}: backup to {} failed: {}",
            file.name,
            file.backup_path.display(),
            e
        );
    }
}

/// Write the body to the temp path with the target mode and owner
pub fn write_temp(file: &ConfigFile) -> Result<(), ApplyError> {
    let temp = &file.temp_path;
    let write_err = |source| ApplyError::WriteTemp {
        path: temp.clone(),
        source,
    };

    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(file.mode)
        .open(temp)
        .map_err(write_err)?;
    out.write_all(file.body.as_bytes()).map_err(write_err)?;
    out.sync_all().map_err(write_err)?;
    drop(out);

    // open() applies the umask and leaves an existing file's mode alone
    fs::set_permissions(temp, fs::Permissions::from_mode(file.mode)).map_err(write_err)?;

    let meta = fs::metadata(temp).map_err(write_err)?;
    if meta.uid() != file.uid || meta.gid() != file.gid {
        std::os::unix::fs::chown(temp, Some(file.uid), Some(file.gid)).map_err(|source| {
            ApplyError::Chown {
                path: temp.clone(),
                uid: file.uid,
                gid: file.gid,
                source,
            }
        })?;
    }
    Ok(())
}

/// Rename the temp file over the live path
pub fn commit_temp(file: &ConfigFile) -> Result<(), ApplyError> {
    fs::rename(&file.temp_path, &file.path).map_err(|source| ApplyError::Rename {
        path: file.path.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_file::Ownership;
    use edgecfg_common::ConfigFileRecord;
    use std::path::Path;
    use tempfile::TempDir;

    fn scope() -> ApplyScope {
        ApplyScope {
            run_mode: RunMode::Syncds,
            files: ApplyFiles::All,
            report_only: false,
            sync_ds_updates_ip_allow: false,
        }
    }

    fn audited(dir: &Path, name: &str, body: &str) -> ConfigFile {
        let record = ConfigFileRecord::new(name, &dir.to_string_lossy(), body);
        let mut file =
            ConfigFile::from_record(&record, dir, &dir.join("backups"), &Ownership::current());
        file.audit.complete = true;
        file.audit.change_needed = true;
        file
    }

    #[test]
    fn test_apply_writes_mode_and_flags() {
        let dir = TempDir::new().unwrap();
        let applier = FileSystemApplier::new(scope(), dir.path().to_path_buf());
        let mut file = audited(dir.path(), "records.config", "CONFIG a INT 1\n");

        let restart = applier.apply(&mut file).unwrap();
        assert!(file.audit.change_applied);
        assert!(restart.traffic_ctl_reload);
        assert_eq!(fs::read_to_string(&file.path).unwrap(), "CONFIG a INT 1\n");
        let mode = fs::metadata(&file.path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        assert!(!file.temp_path.exists());
    }

    #[test]
    fn test_crash_between_write_and_rename() {
        let dir = TempDir::new().unwrap();
        let mut file = audited(dir.path(), "remap.config", "map /a /new\n");
        fs::write(&file.path, "map /a /old\n").unwrap();

        // temp written, process dies before the rename
        write_temp(&file).unwrap();
        assert_eq!(fs::read_to_string(&file.path).unwrap(), "map /a /old\n");
        assert!(file.temp_path.exists());

        // the next run overwrites the stale temp and commits
        let applier = FileSystemApplier::new(scope(), dir.path().to_path_buf());
        applier.apply(&mut file).unwrap();
        assert_eq!(fs::read_to_string(&file.path).unwrap(), "map /a /new\n");
        assert!(!file.temp_path.exists());
    }

    #[test]
    fn test_secure_file_mode() {
        let dir = TempDir::new().unwrap();
        let mut file = audited(dir.path(), "edge.key", "KEY");
        file.mode = crate::config_file::SECURE_MODE;
        write_temp(&file).unwrap();
        let mode = fs::metadata(&file.temp_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_backup_of_previous_version() {
        let dir = TempDir::new().unwrap();
        let applier = FileSystemApplier::new(scope(), dir.path().to_path_buf());
        let mut file = audited(dir.path(), "cache.config", "new\n");
        fs::write(&file.path, "old\n").unwrap();
        applier.apply(&mut file).unwrap();
        assert_eq!(fs::read_to_string(&file.backup_path).unwrap(), "old\n");
    }

    #[test]
    fn test_report_only_is_noop() {
        let dir = TempDir::new().unwrap();
        let applier = FileSystemApplier::new(
            ApplyScope {
                report_only: true,
                ..scope()
            },
            dir.path().to_path_buf(),
        );
        let mut file = audited(dir.path(), "records.config", "x\n");
        assert!(applier.apply(&mut file).unwrap().is_empty());
        assert!(!file.audit.change_applied);
        assert!(!file.path.exists());
    }

    #[test]
    fn test_reval_scope() {
        let dir = TempDir::new().unwrap();
        let applier = FileSystemApplier::new(
            ApplyScope {
                files: ApplyFiles::Reval,
                ..scope()
            },
            dir.path().to_path_buf(),
        );
        let mut other = audited(dir.path(), "records.config", "x\n");
        applier.apply(&mut other).unwrap();
        assert!(!other.audit.change_applied);

        let mut reval = audited(dir.path(), REVAL_FILE, "http://a/.* 1700000000\n");
        applier.apply(&mut reval).unwrap();
        assert!(reval.audit.change_applied);
    }

    #[test]
    fn test_ip_allow_guard() {
        let dir = TempDir::new().unwrap();
        let syncds = FileSystemApplier::new(scope(), dir.path().to_path_buf());
        let mut file = audited(dir.path(), IP_ALLOW_FILE, "src_ip=0.0.0.0 action=ip_allow\n");
        syncds.apply(&mut file).unwrap();
        assert!(!file.audit.change_applied);

        let allowed = FileSystemApplier::new(
            ApplyScope {
                sync_ds_updates_ip_allow: true,
                ..scope()
            },
            dir.path().to_path_buf(),
        );
        allowed.apply(&mut file).unwrap();
        assert!(file.audit.change_applied);
    }

    #[test]
    fn test_unaudited_refused() {
        let dir = TempDir::new().unwrap();
        let applier = FileSystemApplier::new(scope(), dir.path().to_path_buf());
        let mut file = audited(dir.path(), "records.config", "x\n");
        file.audit.failed = true;
        assert!(matches!(
            applier.apply(&mut file),
            Err(ApplyError::NotAudited { .. })
        ));
        assert!(!file.path.exists());
    }
}
