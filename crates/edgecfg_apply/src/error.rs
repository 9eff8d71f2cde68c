//! Error types, one enum per component.
//!
//! Variants carry the file, package or service they concern so the run
//! summary can name it without extra bookkeeping.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to reach or understand the control plane. Never means "nothing to do".
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("control plane request '{request}' failed: {reason}")]
    Request { request: String, reason: String },

    #[error("invalid control plane response for '{request}': {reason}")]
    Parse { request: String, reason: String },
}

/// Failure to produce the desired config snapshot
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("config generator failed: {0}")]
    Command(String),

    #[error("invalid generator output: {0}")]
    Parse(String),
}

/// Per-file audit failure
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("config file has no name or directory (name='{name}', dir='{dir}')")]
    InvalidTarget { name: String, dir: String },

    #[error("{file}: cannot create directory {}: {source}", .dir.display())]
    CreateDir {
        file: String,
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{file}: {reason}")]
    PrerequisiteFailed { file: String, reason: String },

    #[error("{file}: audit failed earlier: {reason}")]
    Recorded { file: String, reason: String },

    #[error("{file}: invalid certificate: {reason}")]
    Certificate { file: String, reason: String },

    #[error("{file}: cannot read current contents: {source}")]
    ReadCurrent {
        file: String,
        #[source]
        source: io::Error,
    },
}

/// Per-file apply failure
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{file}: refusing to apply a file that has not passed audit")]
    NotAudited { file: String },

    #[error("{}: writing temp file failed: {source}", .path.display())]
    WriteTemp {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: setting owner {uid}:{gid} failed: {source}", .path.display())]
    Chown {
        path: PathBuf,
        uid: u32,
        gid: u32,
        #[source]
        source: io::Error,
    },

    #[error("{}: rename into place failed: {source}", .path.display())]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Package step failure; aborts the step
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("package {0} is not available in any repository")]
    Unavailable(String),

    #[error("querying package {package} failed: {reason}")]
    Query { package: String, reason: String },

    #[error("installing {package} failed: {reason}")]
    Install { package: String, reason: String },

    #[error("removing {package} failed: {reason}")]
    Remove { package: String, reason: String },

    #[error("installed packages do not match the manifest: {}", .0.join(", "))]
    Mismatch(Vec<String>),
}

/// Service command failure; fatal to the run
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{action} {service} failed: {reason}")]
    Command {
        service: String,
        action: String,
        reason: String,
    },

    #[error("reload classifier failed: {0}")]
    Classifier(String),

    #[error("no usable service manager on this host")]
    NoServiceManager,
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {args} failed: {reason}")]
    Command { args: String, reason: String },

    #[error("git repository io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot lock {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
