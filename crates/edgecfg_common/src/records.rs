//! Records exchanged with the control plane and the config generator.
//!
//! These are the JSON shapes produced by the helper tools; the agent never
//! speaks the control-plane wire protocol itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Generated Config Snapshot
// ============================================================================

/// One generated configuration file, as emitted by the generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFileRecord {
    /// File name (e.g. "remap.config")
    pub name: String,
    /// Destination directory
    pub path: String,
    /// Full desired content
    pub text: String,
    /// Contains key material (written 0600)
    #[serde(default)]
    pub secure: bool,
    /// Generator warnings attached to this file
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ConfigFileRecord {
    pub fn new(name: &str, path: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            text: text.to_string(),
            secure: false,
            warnings: Vec::new(),
        }
    }
}

// ============================================================================
// Update Status
// ============================================================================

/// Pending-work record for one server, as held by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateStatusRecord {
    /// Administrative status of the server (e.g. "REPORTED")
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub update_pending: bool,
    #[serde(default)]
    pub parent_pending: bool,
    #[serde(default)]
    pub reval_pending: bool,
    #[serde(default)]
    pub parent_reval_pending: bool,
    /// Control plane tracks revalidations separately from config updates
    #[serde(default)]
    pub use_reval_pending: bool,
    #[serde(default)]
    pub config_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reval_update_time: Option<DateTime<Utc>>,
}

/// Request to clear pending bits.
///
/// The apply times echo the update times observed at the start of the run,
/// so an update queued mid-run is not lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_apply_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reval_apply_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_pending: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reval_pending: Option<bool>,
}

impl UpdateRequest {
    /// True when the request would change nothing upstream
    pub fn is_empty(&self) -> bool {
        self.update_pending.is_none() && self.reval_pending.is_none()
    }
}

// ============================================================================
// Packages And Services
// ============================================================================

/// Desired package from the manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageEntry {
    pub name: String,
    pub version: String,
}

impl PackageEntry {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    /// Full package name as the package manager prints it ("name-version")
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// Boot enablement entry (e.g. `{"name": "trafficserver", "value": "0:off 1:off 2:on ..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChkconfigEntry {
    pub name: String,
    pub value: String,
}

impl ChkconfigEntry {
    /// Run levels flagged "on"
    pub fn enabled_levels(&self) -> Vec<String> {
        self.value
            .split_whitespace()
            .filter_map(|item| {
                let (level, state) = item.split_once(':')?;
                if state == "on" {
                    Some(level.to_string())
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Disruption a config change needs, as judged by the reload classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceNeeds {
    #[default]
    NeedsNothing,
    NeedsReload,
    NeedsRestart,
}

impl ServiceNeeds {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceNeeds::NeedsNothing => "needs-nothing",
            ServiceNeeds::NeedsReload => "needs-reload",
            ServiceNeeds::NeedsRestart => "needs-restart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "needs-nothing" => Some(ServiceNeeds::NeedsNothing),
            "needs-reload" => Some(ServiceNeeds::NeedsReload),
            "needs-restart" => Some(ServiceNeeds::NeedsRestart),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_record_defaults() {
        let rec: ConfigFileRecord =
            serde_json::from_str(r#"{"name":"a.config","path":"/etc/x","text":"hi"}"#).unwrap();
        assert!(!rec.secure);
        assert!(rec.warnings.is_empty());
    }

    #[test]
    fn test_update_status_parse() {
        let rec: UpdateStatusRecord = serde_json::from_str(
            r#"{"status":"REPORTED","update_pending":true,"parent_pending":false,
                "config_update_time":"2026-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        assert!(rec.update_pending);
        assert!(!rec.reval_pending);
        assert!(rec.config_update_time.is_some());
        assert!(rec.reval_update_time.is_none());
    }

    #[test]
    fn test_update_request_skips_unset() {
        let req = UpdateRequest {
            update_pending: Some(false),
            ..Default::default()
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"update_pending":false}"#);
        assert!(!req.is_empty());
        assert!(UpdateRequest::default().is_empty());
    }

    #[test]
    fn test_package_full_name() {
        assert_eq!(PackageEntry::new("trafficserver", "9.2.1").full_name(), "trafficserver-9.2.1");
    }

    #[test]
    fn test_chkconfig_levels() {
        let entry = ChkconfigEntry {
            name: "trafficserver".to_string(),
            value: "0:off 1:off 2:on 3:on 4:on 5:on 6:off".to_string(),
        };
        assert_eq!(entry.enabled_levels(), vec!["2", "3", "4", "5"]);
    }

    #[test]
    fn test_service_needs_roundtrip_names() {
        assert_eq!(ServiceNeeds::parse("needs-reload"), Some(ServiceNeeds::NeedsReload));
        assert_eq!(ServiceNeeds::parse("whatever"), None);
        assert!(ServiceNeeds::NeedsRestart > ServiceNeeds::NeedsReload);
    }
}
