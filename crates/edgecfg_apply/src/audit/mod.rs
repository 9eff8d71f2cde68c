//! Config Auditor v1.0
//!
//! Decides, per file, whether the desired body may be written and whether
//! it needs to be:
//! - target validity and directory creation
//! - udev device ownership (warnings only)
//! - remap override resolution
//! - plugin and parameter-file prerequisites for plugin.config / remap.config
//! - certificate decoding and validity
//! - semantic diff against disk (content, mode, owner)
//!
//! Auditing a file twice returns the first result; the checks never rerun.

pub mod cert;
pub mod diff;
pub mod refs;
pub mod remap;
pub mod udev;

use crate::config_file::ConfigFile;
use crate::error::AuditError;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use self::udev::{UdevAudit, UDEV_RULES_NAME};

pub const REMAP_CONFIG: &str = "remap.config";
pub const PLUGIN_CONFIG: &str = "plugin.config";

/// Host paths the auditor checks against
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub config_dir: PathBuf,
    pub plugin_dir: PathBuf,
    pub udev: UdevAudit,
    /// Never create directories, log diffs at info level
    pub report_only: bool,
}

pub struct ConfigAuditor {
    ctx: AuditContext,
    remap_plugin_configs: BTreeSet<String>,
}

impl ConfigAuditor {
    pub fn new(ctx: AuditContext) -> Self {
        Self {
            ctx,
            remap_plugin_configs: BTreeSet::new(),
        }
    }

    /// Learn which files remap.config hands to its plugins, from the snapshot
    pub fn prepare(&mut self, files: &[ConfigFile]) {
        self.remap_plugin_configs = files
            .iter()
            .find(|f| f.name == REMAP_CONFIG)
            .map(|f| refs::remap_plugin_config_names(&f.body))
            .unwrap_or_default();
    }

    pub fn audit(&self, file: &mut ConfigFile, files_adding: &[String]) -> Result<(), AuditError> {
        if file.audit.complete {
            if file.audit.failed {
                return Err(AuditError::Recorded {
                    file: file.name.clone(),
                    reason: file.audit.error.clone().unwrap_or_default(),
                });
            }
            return Ok(());
        }

        let result = self.run_checks(file, files_adding);
        file.audit.complete = true;
        if let Err(e) = &result {
            warn!("audit failed: {}", e);
            file.fail_audit(&e.to_string());
        }
        result
    }

    fn run_checks(&self, file: &mut ConfigFile, files_adding: &[String]) -> Result<(), AuditError> {
        if file.name.trim().is_empty() || file.dir.as_os_str().is_empty() {
            return Err(AuditError::InvalidTarget {
                name: file.name.clone(),
                dir: file.dir.display().to_string(),
            });
        }

        if !file.dir.exists() {
            if self.ctx.report_only {
                info!("{}: would create directory {}", file.name, file.dir.display());
            } else {
                fs::create_dir_all(&file.dir).map_err(|source| AuditError::CreateDir {
                    file: file.name.clone(),
                    dir: file.dir.clone(),
                    source,
                })?;
                info!("created directory {}", file.dir.display());
            }
        }

        if file.name == UDEV_RULES_NAME {
            for w in self.ctx.udev.check(&file.body) {
                warn!("{}: {}", file.name, w);
                file.warnings.push(w);
            }
        }

        if file.name == REMAP_CONFIG {
            if let Some(rewritten) = remap::resolve_overrides(&file.body) {
                debug!("{}: applied remap overrides", file.name);
                file.body = rewritten;
            }
        }

        if file.name == PLUGIN_CONFIG || file.name == REMAP_CONFIG {
            self.check_prerequisites(file, files_adding)?;
        }

        if self.remap_plugin_configs.contains(&file.name) {
            file.audit.is_remap_plugin_config = true;
        }

        if cert::needs_certificate_check(&file.name, &file.body) {
            let warnings = cert::check_certificates(&file.body).map_err(|reason| {
                AuditError::Certificate {
                    file: file.name.clone(),
                    reason,
                }
            })?;
            for w in warnings {
                warn!("{}: {}", file.name, w);
                file.warnings.push(w);
            }
        }

        let diff = diff::diff_file(file).map_err(|source| AuditError::ReadCurrent {
            file: file.name.clone(),
            source,
        })?;
        if diff.any() {
            file.audit.change_needed = true;
            let detail = if diff.missing {
                "new file".to_string()
            } else {
                format!(
                    "content={} mode={} owner={}",
                    diff.content_changed, diff.mode_changed, diff.owner_changed
                )
            };
            info!("{}: change needed ({})", file.path.display(), detail);
            for line in &diff.lines {
                if self.ctx.report_only {
                    info!("  {}", line);
                } else {
                    debug!("  {}", line);
                }
            }
        } else {
            debug!("{}: no change", file.path.display());
        }
        Ok(())
    }

    fn check_prerequisites(
        &self,
        file: &mut ConfigFile,
        files_adding: &[String],
    ) -> Result<(), AuditError> {
        let found = if file.name == PLUGIN_CONFIG {
            refs::plugin_config_refs(&file.body)
        } else {
            refs::remap_config_refs(&file.body)
        };
        let missing =
            refs::missing_refs(&found, &self.ctx.plugin_dir, &self.ctx.config_dir, files_adding);
        if missing.is_empty() {
            return Ok(());
        }
        file.audit.pre_req_failed = true;
        Err(AuditError::PrerequisiteFailed {
            file: file.name.clone(),
            reason: format!("missing {}", missing.join(", ")),
        })
    }
}
