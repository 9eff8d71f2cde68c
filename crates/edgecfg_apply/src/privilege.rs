//! Effective-user check for modes that change the node.

use edgecfg_common::RunMode;
use nix::unistd::Uid;
use tracing::{debug, error};

/// Whether `mode` may run as the effective user `uid`
pub fn user_allowed(mode: RunMode, uid: Uid) -> bool {
    if !mode.requires_root() {
        return true;
    }
    if uid.is_root() {
        return true;
    }
    error!("run mode '{}' must be run as root (effective uid {})", mode, uid);
    false
}

/// Check the current process
pub fn check_user(mode: RunMode, enabled: bool) -> bool {
    if !enabled {
        debug!("user check disabled");
        return true;
    }
    user_allowed(mode, Uid::effective())
}
