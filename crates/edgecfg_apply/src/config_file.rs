//! Per-file state carried through audit and apply.

use edgecfg_common::ConfigFileRecord;
use nix::unistd::{Gid, Uid, User};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Mode for ordinary config files
pub const DEFAULT_MODE: u32 = 0o644;

/// Mode for files holding key material
pub const SECURE_MODE: u32 = 0o600;

/// Service that consumes a config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwningService {
    TrafficServer,
    System,
    Ntpd,
    Unknown,
}

impl OwningService {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwningService::TrafficServer => "trafficserver",
            OwningService::System => "system",
            OwningService::Ntpd => "ntpd",
            OwningService::Unknown => "unknown",
        }
    }

    /// Assign from the destination directory and file name
    pub fn assign(name: &str, dir: &Path, ts_home: &Path) -> Self {
        if name == "ntpd.conf" {
            return OwningService::Ntpd;
        }
        if dir.starts_with(ts_home) || dir.to_string_lossy().ends_with("trafficserver") {
            return OwningService::TrafficServer;
        }
        if dir.starts_with("/etc") {
            return OwningService::System;
        }
        OwningService::Unknown
    }
}

/// uid/gid that cache-owned files are written with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub cache_uid: u32,
    pub cache_gid: u32,
}

impl Ownership {
    /// Look up the cache user; falls back to the current user when it does not exist
    pub fn resolve(cache_user: &str) -> Self {
        match User::from_name(cache_user) {
            Ok(Some(user)) => Self {
                cache_uid: user.uid.as_raw(),
                cache_gid: user.gid.as_raw(),
            },
            Ok(None) => {
                warn!("cache user '{}' not found, using the current user", cache_user);
                Self::current()
            }
            Err(e) => {
                warn!("looking up cache user '{}' failed: {}", cache_user, e);
                Self::current()
            }
        }
    }

    pub fn current() -> Self {
        Self {
            cache_uid: Uid::effective().as_raw(),
            cache_gid: Gid::effective().as_raw(),
        }
    }

    /// uid/gid for a file consumed by `service`
    pub fn for_service(&self, service: OwningService) -> (u32, u32) {
        match service {
            OwningService::TrafficServer => (self.cache_uid, self.cache_gid),
            _ => (0, 0),
        }
    }
}

// ============================================================================
// Audit Flags
// ============================================================================

/// Progress of one file through the run. Flags only ever go from false to true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFlags {
    pub complete: bool,
    pub failed: bool,
    pub error: Option<String>,
    pub change_needed: bool,
    pub change_applied: bool,
    pub pre_req_failed: bool,
    pub is_remap_plugin_config: bool,
}

// ============================================================================
// Config File
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub name: String,
    pub dir: PathBuf,
    pub path: PathBuf,
    pub service: OwningService,
    pub temp_path: PathBuf,
    pub backup_path: PathBuf,
    pub body: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub secure: bool,
    pub audit: AuditFlags,
    pub warnings: Vec<String>,
}

impl ConfigFile {
    pub fn from_record(
        record: &ConfigFileRecord,
        ts_home: &Path,
        backup_dir: &Path,
        ownership: &Ownership,
    ) -> Self {
        let dir = PathBuf::from(&record.path);
        let path = dir.join(&record.name);
        let service = OwningService::assign(&record.name, &dir, ts_home);
        let (uid, gid) = ownership.for_service(service);
        let mut temp = path.clone().into_os_string();
        temp.push(".tmp");
        Self {
            name: record.name.clone(),
            temp_path: PathBuf::from(temp),
            backup_path: backup_dir.join(&record.name),
            dir,
            path,
            service,
            body: record.text.clone(),
            mode: if record.secure { SECURE_MODE } else { DEFAULT_MODE },
            uid,
            gid,
            secure: record.secure,
            audit: AuditFlags::default(),
            warnings: record.warnings.clone(),
        }
    }

    /// Mark the audit failed with a reason
    pub fn fail_audit(&mut self, reason: &str) {
        self.audit.failed = true;
        self.audit.error = Some(reason.to_string());
    }
}
