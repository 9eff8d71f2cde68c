//! edgecfg-apply library - exposes modules for testing.

pub mod audit;
pub mod config;
pub mod config_file;
pub mod control_plane;
pub mod error;
pub mod exec;
pub mod fs_apply;
pub mod generator;
pub mod git;
pub mod lock;
pub mod packages;
pub mod privilege;
pub mod reconciler;
pub mod restart;
pub mod service_control;
pub mod services;
pub mod tail;
pub mod update_status;

pub use reconciler::{Collaborators, Reconciler, RunOutcome};
