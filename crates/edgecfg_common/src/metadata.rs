//! Run metadata v1.0
//!
//! Written to the config directory at the end of every run (success or not):
//! - what the run did to services and upstream flags
//! - which packages are installed and which files this agent owns
//! - the ordered action log `[{action, status}]`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Metadata schema version
pub const METADATA_VERSION: &str = "1.0";

/// File name of the metadata file inside the config directory
pub const METADATA_FILE_NAME: &str = "edgecfg-apply-metadata.json";

// ============================================================================
// Action Log
// ============================================================================

pub const ACTION_APPLY_START: &str = "apply-start";
pub const ACTION_GIT_INIT: &str = "git-init";
pub const ACTION_GIT_COMMIT_INITIAL: &str = "git-commit-initial";
pub const ACTION_CHECK_USER: &str = "check-user";
pub const ACTION_CHECK_STATUS: &str = "check-update-status";
pub const ACTION_PACKAGES: &str = "process-packages";
pub const ACTION_SYSTEM_SERVICES: &str = "check-system-services";
pub const ACTION_GENERATE: &str = "generate-config-files";
pub const ACTION_UPDATE_FILES_ALL: &str = "update-files-all";
pub const ACTION_UPDATE_FILES_REVAL: &str = "update-files-reval";
pub const ACTION_SERVICE: &str = "service-action";
pub const ACTION_UPDATE_CONTROL_PLANE: &str = "update-control-plane";
pub const ACTION_GIT_COMMIT_FINAL: &str = "git-commit-final";
pub const ACTION_APPLY_END: &str = "apply-end";

/// Outcome of one logged action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Failure,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::Failure => "failure",
            ActionStatus::Skipped => "skipped",
        }
    }

    pub fn from_ok(ok: bool) -> Self {
        if ok {
            ActionStatus::Success
        } else {
            ActionStatus::Failure
        }
    }
}

/// Entry in the action log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    pub status: ActionStatus,
}

// ============================================================================
// Metadata
// ============================================================================

/// Summary of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApplyMetaData {
    pub version: String,
    #[serde(default)]
    pub server_hostname: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reloaded_cache: bool,
    #[serde(default)]
    pub restarted_cache: bool,
    #[serde(default)]
    pub unset_update_flag: bool,
    #[serde(default)]
    pub unset_reval_flag: bool,
    #[serde(default)]
    pub installed_packages: Vec<String>,
    #[serde(default)]
    pub owned_files: Vec<String>,
    #[serde(default)]
    pub succeeded: bool,
    #[serde(default)]
    pub partial_success: bool,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
}

impl ApplyMetaData {
    pub fn new(server_hostname: &str) -> Self {
        Self {
            version: METADATA_VERSION.to_string(),
            server_hostname: server_hostname.to_string(),
            start_time: Some(Utc::now()),
            end_time: None,
            reloaded_cache: false,
            restarted_cache: false,
            unset_update_flag: false,
            unset_reval_flag: false,
            installed_packages: Vec::new(),
            owned_files: Vec::new(),
            succeeded: false,
            partial_success: false,
            actions: Vec::new(),
        }
    }

    /// Append to the action log
    pub fn record(&mut self, action: &str, status: ActionStatus) {
        self.actions.push(ActionRecord {
            action: action.to_string(),
            status,
        });
    }

    /// Merge newly owned paths with those owned by a previous run, sorted and deduplicated
    pub fn combine_owned_files(&mut self, previous: &[String]) {
        let merged: BTreeSet<String> = self
            .owned_files
            .iter()
            .chain(previous.iter())
            .cloned()
            .collect();
        self.owned_files = merged.into_iter().collect();
    }

    /// Pretty JSON with a trailing newline
    pub fn format(&self) -> Result<String, serde_json::Error> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    /// Load the previous run's metadata. Missing or unreadable files yield None.
    pub fn load(path: &Path) -> Option<Self> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read previous metadata {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("Failed to parse previous metadata {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Write the metadata file in place
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let body = self
            .format()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, body)
    }
}
