//! Process exit codes, stable across releases so schedulers can alert on them.

use serde::{Deserialize, Serialize};

/// Exit status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Success,
    AlreadyRunning,
    ConfigFilesError,
    ConfigError,
    GeneralFailure,
    PackagingError,
    RevalidationError,
    ServicesError,
    SyncError,
    UserCheckError,
}

impl ExitCode {
    pub fn as_i32(&self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::AlreadyRunning => 132,
            ExitCode::ConfigFilesError => 133,
            ExitCode::ConfigError => 134,
            ExitCode::GeneralFailure => 135,
            ExitCode::PackagingError => 136,
            ExitCode::RevalidationError => 137,
            ExitCode::ServicesError => 138,
            ExitCode::SyncError => 139,
            ExitCode::UserCheckError => 140,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitCode::Success => "success",
            ExitCode::AlreadyRunning => "already running",
            ExitCode::ConfigFilesError => "config files error",
            ExitCode::ConfigError => "config error",
            ExitCode::GeneralFailure => "general failure",
            ExitCode::PackagingError => "packaging error",
            ExitCode::RevalidationError => "revalidation error",
            ExitCode::ServicesError => "services error",
            ExitCode::SyncError => "sync error",
            ExitCode::UserCheckError => "user check error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}
