//! Run modes and the tri-state switches that a run is configured with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a mode string does not name a known value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}' (expected one of: {expected})")]
pub struct ParseModeError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl ParseModeError {
    fn new(kind: &'static str, value: &str, expected: &'static str) -> Self {
        Self {
            kind,
            value: value.to_string(),
            expected,
        }
    }
}

// ============================================================================
// Run Mode
// ============================================================================

/// What a single run is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Apply everything, install packages, restart services, ignore the update flag
    Badass,
    /// Audit and diff only, no side effects
    Report,
    /// Only revalidation files, only when a revalidation is pending
    Revalidate,
    /// Apply queued updates (the periodic default)
    #[default]
    Syncds,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Badass => "badass",
            RunMode::Report => "report",
            RunMode::Revalidate => "revalidate",
            RunMode::Syncds => "syncds",
        }
    }

    /// Modes that change the node and therefore need root
    pub fn requires_root(&self) -> bool {
        matches!(self, RunMode::Badass | RunMode::Syncds)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "badass" => Ok(RunMode::Badass),
            "report" => Ok(RunMode::Report),
            "revalidate" => Ok(RunMode::Revalidate),
            "syncds" => Ok(RunMode::Syncds),
            _ => Err(ParseModeError::new(
                "run mode",
                s,
                "badass, report, revalidate, syncds",
            )),
        }
    }
}

// ============================================================================
// Service Action
// ============================================================================

/// Operator override for the cache service action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceActionFlag {
    /// Reload when needed, restart only when a file demands it
    #[default]
    Reload,
    /// Always restart when anything changed
    Restart,
    /// Never touch the cache service
    None,
}

impl ServiceActionFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceActionFlag::Reload => "reload",
            ServiceActionFlag::Restart => "restart",
            ServiceActionFlag::None => "none",
        }
    }
}

impl FromStr for ServiceActionFlag {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reload" => Ok(ServiceActionFlag::Reload),
            "restart" => Ok(ServiceActionFlag::Restart),
            "none" => Ok(ServiceActionFlag::None),
            _ => Err(ParseModeError::new(
                "service action",
                s,
                "reload, restart, none",
            )),
        }
    }
}

// ============================================================================
// Wait For Parents
// ============================================================================

/// Whether to hold back while parent caches still have work pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaitForParents {
    True,
    False,
    /// Wait on parents only for revalidations, not for config updates
    #[default]
    Reval,
}

impl WaitForParents {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitForParents::True => "true",
            WaitForParents::False => "false",
            WaitForParents::Reval => "reval",
        }
    }
}

impl FromStr for WaitForParents {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Ok(WaitForParents::True),
            "false" | "no" => Ok(WaitForParents::False),
            "reval" => Ok(WaitForParents::Reval),
            _ => Err(ParseModeError::new(
                "wait-for-parents",
                s,
                "true, false, reval",
            )),
        }
    }
}

// ============================================================================
// Git
// ============================================================================

/// Whether to snapshot the config directory into git
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UseGit {
    /// Create the repository if missing
    Yes,
    No,
    /// Commit only if a repository already exists
    #[default]
    Auto,
}

impl UseGit {
    pub fn as_str(&self) -> &'static str {
        match self {
            UseGit::Yes => "yes",
            UseGit::No => "no",
            UseGit::Auto => "auto",
        }
    }
}

impl FromStr for UseGit {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "yes" | "true" => Ok(UseGit::Yes),
            "no" | "false" => Ok(UseGit::No),
            "auto" => Ok(UseGit::Auto),
            _ => Err(ParseModeError::new("use-git", s, "yes, no, auto")),
        }
    }
}

// ============================================================================
// File Scope
// ============================================================================

/// Which generated files a run may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApplyFiles {
    #[default]
    All,
    /// Only the revalidation rules file
    Reval,
}

impl ApplyFiles {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyFiles::All => "all",
            ApplyFiles::Reval => "reval",
        }
    }
}

/// Cache engine on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    #[default]
    Ats,
    Varnish,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Ats => "ats",
            CacheType::Varnish => "varnish",
        }
    }

    /// Unit name of the cache service
    pub fn service_name(&self) -> &'static str {
        match self {
            CacheType::Ats => "trafficserver",
            CacheType::Varnish => "varnish",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_parse() {
        assert_eq!("badass".parse::<RunMode>().unwrap(), RunMode::Badass);
        assert_eq!(" SyncDS ".parse::<RunMode>().unwrap(), RunMode::Syncds);
        assert!("bogus".parse::<RunMode>().is_err());
    }

    #[test]
    fn test_run_mode_root() {
        assert!(RunMode::Badass.requires_root());
        assert!(RunMode::Syncds.requires_root());
        assert!(!RunMode::Report.requires_root());
        assert!(!RunMode::Revalidate.requires_root());
    }

    #[test]
    fn test_wait_for_parents_default_is_reval() {
        assert_eq!(WaitForParents::default(), WaitForParents::Reval);
        assert_eq!("no".parse::<WaitForParents>().unwrap(), WaitForParents::False);
    }

    #[test]
    fn test_parse_error_message() {
        let err = "sometimes".parse::<UseGit>().unwrap_err();
        assert!(err.to_string().contains("sometimes"));
        assert!(err.to_string().contains("yes, no, auto"));
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&ServiceActionFlag::Restart).unwrap();
        assert_eq!(json, "\"restart\"");
    }
}
