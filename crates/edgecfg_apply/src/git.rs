//! Git audit trail for the config directory.
//!
//! The run commits twice: once at the start to capture anything changed
//! behind our back, and once at the end for our own changes. Both commits
//! go through the command runner.

use crate::error::GitError;
use crate::exec::{CommandOutput, CommandRunner};
use chrono::Utc;
use edgecfg_common::UseGit;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// An index lock older than this was left by a dead git process
pub const MAX_LOCK_AGE: Duration = Duration::from_secs(5 * 60);

const AUTHOR_NAME: &str = "user.name=edgecfg-apply";
const AUTHOR_EMAIL: &str = "user.email=edgecfg-apply@localhost";

pub struct GitRecorder {
    runner: Arc<dyn CommandRunner>,
    git_cmd: String,
    dir: PathBuf,
    mode: UseGit,
}

impl GitRecorder {
    pub fn new(runner: Arc<dyn CommandRunner>, git_cmd: &str, dir: &Path, mode: UseGit) -> Self {
        Self {
            runner,
            git_cmd: git_cmd.to_string(),
            dir: dir.to_path_buf(),
            mode,
        }
    }

    fn git_dir(&self) -> PathBuf {
        self.dir.join(".git")
    }

    fn git(&self, args: &[&str]) -> Result<CommandOutput, GitError> {
        let dir = self.dir.to_string_lossy();
        let mut full = vec!["-C", dir.as_ref(), "-c", AUTHOR_NAME, "-c", AUTHOR_EMAIL];
        full.extend_from_slice(args);
        let out = self.runner.run(&self.git_cmd, &full)?;
        if !out.success() {
            return Err(GitError::Command {
                args: args.join(" "),
                reason: out.reason(),
            });
        }
        Ok(out)
    }

    /// Whether this run records to git, creating the repository when asked to
    pub fn ensure_repo(&self) -> Result<bool, GitError> {
        match self.mode {
            UseGit::No => Ok(false),
            UseGit::Auto => {
                let exists = self.git_dir().is_dir();
                if !exists {
                    debug!("{} is not a git repository, not recording", self.dir.display());
                }
                Ok(exists)
            }
            UseGit::Yes => {
                if !self.git_dir().is_dir() {
                    fs::create_dir_all(&self.dir)?;
                    self.git(&["init"])?;
                    info!("initialised git repository in {}", self.dir.display());
                }
                Ok(true)
            }
        }
    }

    /// Remove an index lock left behind by a git process that died
    pub fn remove_stale_lock(&self, max_age: Duration) -> bool {
        let lock = self.git_dir().join("index.lock");
        let age = match fs::metadata(&lock).and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default(),
            Err(_) => return false,
        };
        if age < max_age {
            return false;
        }
        warn!("removing git lock file older than {}m", max_age.as_secs() / 60);
        match fs::remove_file(&lock) {
            Ok(()) => true,
            Err(e) => {
                warn!("couldn't remove git lock file {}: {}", lock.display(), e);
                false
            }
        }
    }

    /// Commit everything in the directory. `own` marks changes made by this
    /// run, as opposed to changes found on disk. Returns false when clean.
    pub fn commit_all(&self, own: bool, success: bool) -> Result<bool, GitError> {
        self.git(&["add", "--all"])?;
        let status = self.git(&["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            debug!("git: nothing to commit");
            return Ok(false);
        }
        let message = commit_message(own, success);
        self.git(&["commit", "--quiet", "-m", &message])?;
        info!("git: {}", message);
        Ok(true)
    }
}

fn commit_message(own: bool, success: bool) -> String {
    let who = if own { "apply" } else { "found changes not made by edgecfg-apply" };
    let result = if success { "success" } else { "failure" };
    format!(
        "edgecfg-apply {} {} {}",
        who,
        result,
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    )
}
