//! Configuration management for edgecfg-apply.
//!
//! Loads settings from /etc/edgecfg/apply.toml or uses defaults.
//! Install paths are resolved here once and handed to every component.

use anyhow::{bail, Context, Result};
use edgecfg_common::{ApplyFiles, CacheType, RunMode, ServiceActionFlag, UseGit, WaitForParents};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/edgecfg/apply.toml";

/// Default config file path for fallback
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/edgecfg/apply.toml";

// ============================================================================
// [apply]
// ============================================================================

/// Run behaviour and install paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Name of this server as known to the control plane
    #[serde(default)]
    pub cache_host_name: String,

    /// Cache engine running on this node
    #[serde(default)]
    pub cache_type: CacheType,

    /// Cache engine install root
    #[serde(default = "default_ts_home")]
    pub ts_home: PathBuf,

    /// Cache config directory, defaults to `<ts_home>/etc/trafficserver`
    #[serde(default)]
    pub ts_config_dir: Option<PathBuf>,

    /// Directory holding status marker files
    #[serde(default = "default_status_dir")]
    pub status_dir: PathBuf,

    /// Previous versions of replaced files
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// User that owns cache engine config files
    #[serde(default = "default_cache_user")]
    pub cache_user: String,

    /// Advisory lock guarding against concurrent runs
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    #[serde(default)]
    pub run_mode: RunMode,

    /// Which generated files this run may touch
    #[serde(default)]
    pub files: ApplyFiles,

    #[serde(default)]
    pub wait_for_parents: WaitForParents,

    #[serde(default)]
    pub service_action: ServiceActionFlag,

    /// Skip the log-tail confirmation after a reload or restart
    #[serde(default)]
    pub no_confirm_service_action: bool,

    /// Install and remove packages to match the manifest
    #[serde(default)]
    pub install_packages: bool,

    /// Apply even when the control plane has nothing queued
    #[serde(default)]
    pub ignore_update_flag: bool,

    /// Audit and diff only
    #[serde(default)]
    pub report_only: bool,

    /// Allow syncds runs to replace ip_allow.config
    #[serde(default)]
    pub sync_ds_updates_ip_allow: bool,

    #[serde(default)]
    pub use_git: UseGit,

    /// Upper bound of the random sleep before applying a queued update
    #[serde(default)]
    pub dispersion_secs: u64,

    /// Sleep before re-checking parents that still have work pending
    #[serde(default = "default_reval_wait")]
    pub reval_wait_secs: u64,

    /// Refuse to run mutating modes as a non-root user
    #[serde(default = "default_true")]
    pub check_user: bool,
}

fn default_ts_home() -> PathBuf {
    PathBuf::from("/opt/trafficserver")
}

fn default_status_dir() -> PathBuf {
    PathBuf::from("/var/lib/edgecfg/status")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/edgecfg/backups")
}

fn default_cache_user() -> String {
    "ats".to_string()
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/run/edgecfg-apply.lock")
}

fn default_reval_wait() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            cache_host_name: String::new(),
            cache_type: CacheType::default(),
            ts_home: default_ts_home(),
            ts_config_dir: None,
            status_dir: default_status_dir(),
            backup_dir: default_backup_dir(),
            cache_user: default_cache_user(),
            lock_file: default_lock_file(),
            run_mode: RunMode::default(),
            files: ApplyFiles::default(),
            wait_for_parents: WaitForParents::default(),
            service_action: ServiceActionFlag::default(),
            no_confirm_service_action: false,
            install_packages: false,
            ignore_update_flag: false,
            report_only: false,
            sync_ds_updates_ip_allow: false,
            use_git: UseGit::default(),
            dispersion_secs: 0,
            reval_wait_secs: default_reval_wait(),
            check_user: true,
        }
    }
}

impl ApplyConfig {
    /// Cache config directory
    pub fn config_dir(&self) -> PathBuf {
        self.ts_config_dir
            .clone()
            .unwrap_or_else(|| self.ts_home.join("etc/trafficserver"))
    }

    /// Directory searched for plugin shared objects
    pub fn plugin_dir(&self) -> PathBuf {
        self.ts_home.join("libexec/trafficserver")
    }

    /// Cache engine control tool
    pub fn traffic_ctl(&self) -> PathBuf {
        self.ts_home.join("bin/traffic_ctl")
    }
}

// ============================================================================
// [tail]
// ============================================================================

/// Service-action confirmation via the cache diagnostics log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailConfig {
    /// Diagnostics log, defaults to `<ts_home>/var/log/trafficserver/diags.log`
    #[serde(default)]
    pub diags_log: Option<PathBuf>,

    /// Line that marks a completed restart
    #[serde(default = "default_restart_marker")]
    pub restart_marker: String,

    /// Line that marks a completed reload
    #[serde(default = "default_reload_marker")]
    pub reload_marker: String,

    #[serde(default = "default_restart_timeout")]
    pub restart_timeout_ms: u64,

    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_ms: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_restart_marker() -> String {
    "Traffic Server is fully initialized".to_string()
}

fn default_reload_marker() -> String {
    "remap.config finished loading".to_string()
}

fn default_restart_timeout() -> u64 {
    60_000
}

fn default_reload_timeout() -> u64 {
    15_000
}

fn default_poll_interval() -> u64 {
    250
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            diags_log: None,
            restart_marker: default_restart_marker(),
            reload_marker: default_reload_marker(),
            restart_timeout_ms: default_restart_timeout(),
            reload_timeout_ms: default_reload_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl TailConfig {
    pub fn diags_log_path(&self, ts_home: &Path) -> PathBuf {
        self.diags_log
            .clone()
            .unwrap_or_else(|| ts_home.join("var/log/trafficserver/diags.log"))
    }
}

// ============================================================================
// [tools]
// ============================================================================

/// Helper commands that front the control plane and the generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Control-plane request helper (prints JSON)
    #[serde(default = "default_request_cmd")]
    pub request_cmd: String,

    /// Config generator (prints a JSON array of files)
    #[serde(default = "default_generate_cmd")]
    pub generate_cmd: String,

    /// Reload classifier (prints needs-nothing / needs-reload / needs-restart)
    #[serde(default = "default_check_reload_cmd")]
    pub check_reload_cmd: String,

    /// Control-plane update helper (reads a JSON update request on stdin)
    #[serde(default = "default_update_cmd")]
    pub update_cmd: String,

    #[serde(default = "default_git_cmd")]
    pub git_cmd: String,
}

fn default_request_cmd() -> String {
    "/usr/bin/edgecfg-request".to_string()
}

fn default_generate_cmd() -> String {
    "/usr/bin/edgecfg-generate".to_string()
}

fn default_check_reload_cmd() -> String {
    "/usr/bin/edgecfg-check-reload".to_string()
}

fn default_update_cmd() -> String {
    "/usr/bin/edgecfg-update".to_string()
}

fn default_git_cmd() -> String {
    "git".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            request_cmd: default_request_cmd(),
            generate_cmd: default_generate_cmd(),
            check_reload_cmd: default_check_reload_cmd(),
            update_cmd: default_update_cmd(),
            git_cmd: default_git_cmd(),
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub apply: ApplyConfig,

    #[serde(default)]
    pub tail: TailConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Load config from the well-known paths, or return defaults
    pub fn load() -> Self {
        Self::load_from_path(Path::new(CONFIG_PATH))
            .or_else(|_| Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH)))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                Config::default()
            })
    }

    /// Load config from a specific path. A missing file is an error here.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Derive the flags each run mode implies. Called once after CLI overrides.
    pub fn apply_run_mode(&mut self) {
        let a = &mut self.apply;
        match a.run_mode {
            RunMode::Badass => {
                a.service_action = ServiceActionFlag::Restart;
                a.install_packages = true;
                a.ignore_update_flag = true;
                a.sync_ds_updates_ip_allow = true;
            }
            RunMode::Report => {
                a.report_only = true;
                a.ignore_update_flag = true;
            }
            RunMode::Revalidate => {
                a.files = ApplyFiles::Reval;
                a.wait_for_parents = WaitForParents::True;
            }
            RunMode::Syncds => {}
        }
    }

    /// Reject combinations that cannot run
    pub fn validate(&self) -> Result<()> {
        if self.apply.cache_host_name.trim().is_empty() {
            bail!("cache_host_name is not set");
        }
        if !self.apply.ts_home.is_absolute() {
            bail!("ts_home must be absolute: {}", self.apply.ts_home.display());
        }
        if self.tail.poll_interval_ms == 0 {
            bail!("tail.poll_interval_ms must be positive");
        }
        Ok(())
    }
}
