//! edgecfg-apply - Cache node configuration agent
//!
//! Pulls the desired config snapshot for this node, applies what changed
//! and tells the control plane it is done. Exits with the run's exit code.

use anyhow::Result;
use clap::Parser;
use edgecfg_apply::config::Config;
use edgecfg_apply::control_plane::CommandControlPlane;
use edgecfg_apply::exec::{CommandRunner, SystemCommandRunner};
use edgecfg_apply::generator::CommandGenerator;
use edgecfg_apply::packages::RpmPackageManager;
use edgecfg_apply::service_control::CommandReloadClassifier;
use edgecfg_apply::services::{probe_service_management, SYSTEMD_MARKER};
use edgecfg_apply::{Collaborators, Reconciler};
use edgecfg_common::{ExitCode, RunMode, ServiceActionFlag, UseGit, WaitForParents};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "edgecfg-apply")]
#[command(about = "Apply control-plane configuration to this cache node", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: /etc/edgecfg/apply.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// badass, report, revalidate or syncds
    #[arg(long)]
    run_mode: Option<RunMode>,

    /// Name of this cache node in the control plane
    #[arg(long)]
    cache_host_name: Option<String>,

    /// true, reval or false
    #[arg(long)]
    wait_for_parents: Option<WaitForParents>,

    /// reload, restart, or none
    #[arg(long)]
    service_action: Option<ServiceActionFlag>,

    /// Don't tail the diagnostics log after a service action
    #[arg(long)]
    no_confirm_service_action: bool,

    /// yes, no or auto
    #[arg(long)]
    use_git: Option<UseGit>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    let a = &mut config.apply;
    if let Some(mode) = cli.run_mode {
        a.run_mode = mode;
    }
    if let Some(host) = &cli.cache_host_name {
        a.cache_host_name = host.clone();
    }
    if let Some(wait) = cli.wait_for_parents {
        a.wait_for_parents = wait;
    }
    if let Some(action) = cli.service_action {
        a.service_action = action;
    }
    if cli.no_confirm_service_action {
        a.no_confirm_service_action = true;
    }
    if let Some(git) = cli.use_git {
        a.use_git = git;
    }
    config.apply_run_mode();
    config.validate()?;
    Ok(config)
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    info!("edgecfg-apply v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration: {:#}", e);
            std::process::exit(ExitCode::ConfigError.as_i32());
        }
    };

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
    let host = config.apply.cache_host_name.clone();
    let tools = &config.tools;
    let collaborators = Collaborators {
        control_plane: Box::new(CommandControlPlane::new(
            runner.clone(),
            &tools.request_cmd,
            &tools.update_cmd,
            &host,
        )),
        generator: Box::new(CommandGenerator::new(runner.clone(), &tools.generate_cmd, &host)),
        packages: Box::new(RpmPackageManager::new(runner.clone())),
        services: probe_service_management(runner.clone(), Path::new(SYSTEMD_MARKER)),
        classifier: Box::new(CommandReloadClassifier::new(
            runner.clone(),
            &tools.check_reload_cmd,
        )),
        runner,
    };

    let outcome = Reconciler::new(config, collaborators).run();
    std::process::exit(outcome.exit_code.as_i32());
}
