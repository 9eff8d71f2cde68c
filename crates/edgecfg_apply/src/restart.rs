//! Restart Policy v1.0
//!
//! Maps a changed file to the disruption it needs, and folds the per-file
//! results into one run-level decision.
//!
//! Classification is a table, checked top to bottom, first match wins:
//! 1. exact file names
//! 2. remap plugin parameter files and name prefix/suffix families
//! 3. TLS material in an `ssl` directory
//! 4. anything else in the cache config directory
//!
//! A file that matches nothing needs nothing.

use crate::config_file::ConfigFile;
use std::ops::BitOr;
use std::path::Path;

/// Independent disruption flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RestartData {
    pub traffic_ctl_reload: bool,
    pub sysctl_reload: bool,
    pub ntpd_restart: bool,
    pub teakd_restart: bool,
    pub traffic_server_restart: bool,
    pub remap_config_reload: bool,
    pub hitch_reload: bool,
    pub varnish_reload: bool,
}

impl RestartData {
    pub const NONE: RestartData = RestartData {
        traffic_ctl_reload: false,
        sysctl_reload: false,
        ntpd_restart: false,
        teakd_restart: false,
        traffic_server_restart: false,
        remap_config_reload: false,
        hitch_reload: false,
        varnish_reload: false,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }

    /// The cache engine itself must pick up new config
    pub fn cache_reload_needed(&self) -> bool {
        self.traffic_ctl_reload || self.remap_config_reload || self.varnish_reload
    }
}

impl BitOr for RestartData {
    type Output = RestartData;

    fn bitor(self, rhs: RestartData) -> RestartData {
        RestartData {
            traffic_ctl_reload: self.traffic_ctl_reload || rhs.traffic_ctl_reload,
            sysctl_reload: self.sysctl_reload || rhs.sysctl_reload,
            ntpd_restart: self.ntpd_restart || rhs.ntpd_restart,
            teakd_restart: self.teakd_restart || rhs.teakd_restart,
            traffic_server_restart: self.traffic_server_restart || rhs.traffic_server_restart,
            remap_config_reload: self.remap_config_reload || rhs.remap_config_reload,
            hitch_reload: self.hitch_reload || rhs.hitch_reload,
            varnish_reload: self.varnish_reload || rhs.varnish_reload,
        }
    }
}

/// Fold per-file flags into the run-level flags
pub fn aggregate(items: &[RestartData]) -> RestartData {
    items.iter().fold(RestartData::NONE, |acc, item| acc | *item)
}

// ============================================================================
// Rule Table
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Matcher {
    Name(&'static str),
    Prefix(&'static str),
    Suffix(&'static str),
    RemapPluginConfig,
    /// `.cer` / `.key` inside a directory named `ssl`
    SslMaterial,
    DirSuffix(&'static str),
    UnderConfigDir,
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    matcher: Matcher,
    effect: RestartData,
}

const RELOAD: RestartData = RestartData {
    traffic_ctl_reload: true,
    ..RestartData::NONE
};

const REMAP_RELOAD: RestartData = RestartData {
    remap_config_reload: true,
    traffic_ctl_reload: true,
    ..RestartData::NONE
};

const RULES: &[Rule] = &[
    Rule {
        matcher: Matcher::Name("plugin.config"),
        effect: RestartData {
            traffic_server_restart: true,
            traffic_ctl_reload: true,
            ..RestartData::NONE
        },
    },
    Rule {
        matcher: Matcher::Name("remap.config"),
        effect: REMAP_RELOAD,
    },
    Rule {
        matcher: Matcher::Name("ssl_multicert.config"),
        effect: RELOAD,
    },
    Rule {
        matcher: Matcher::Name("records.config"),
        effect: RELOAD,
    },
    Rule {
        matcher: Matcher::Name("sysctl.conf"),
        effect: RestartData {
            sysctl_reload: true,
            ..RestartData::NONE
        },
    },
    Rule {
        matcher: Matcher::Name("ntpd.conf"),
        effect: RestartData {
            ntpd_restart: true,
            ..RestartData::NONE
        },
    },
    Rule {
        matcher: Matcher::Name("hitch.conf"),
        effect: RestartData {
            hitch_reload: true,
            ..RestartData::NONE
        },
    },
    Rule {
        matcher: Matcher::Name("default.vcl"),
        effect: RestartData {
            varnish_reload: true,
            ..RestartData::NONE
        },
    },
    Rule {
        matcher: Matcher::RemapPluginConfig,
        effect: REMAP_RELOAD,
    },
    Rule {
        matcher: Matcher::Prefix("bg_fetch"),
        effect: REMAP_RELOAD,
    },
    Rule {
        matcher: Matcher::Prefix("hdr_rw_"),
        effect: REMAP_RELOAD,
    },
    Rule {
        matcher: Matcher::Prefix("regex_remap_"),
        effect: REMAP_RELOAD,
    },
    Rule {
        matcher: Matcher::Prefix("set_dscp_"),
        effect: REMAP_RELOAD,
    },
    Rule {
        matcher: Matcher::Prefix("url_sig_"),
        effect: REMAP_RELOAD,
    },
    Rule {
        matcher: Matcher::Prefix("uri_signing"),
        effect: REMAP_RELOAD,
    },
    Rule {
        matcher: Matcher::Suffix(".lua"),
        effect: REMAP_RELOAD,
    },
    Rule {
        matcher: Matcher::SslMaterial,
        effect: RELOAD,
    },
    Rule {
        matcher: Matcher::DirSuffix("teakd"),
        effect: RestartData {
            teakd_restart: true,
            ..RestartData::NONE
        },
    },
    Rule {
        matcher: Matcher::DirSuffix("trafficserver"),
        effect: RELOAD,
    },
    Rule {
        matcher: Matcher::UnderConfigDir,
        effect: RELOAD,
    },
];

/// What a file is, as far as classification cares
#[derive(Debug, Clone, Copy)]
pub struct FileClass<'a> {
    pub name: &'a str,
    pub dir: &'a Path,
    pub is_remap_plugin_config: bool,
}

impl Matcher {
    fn matches(&self, file: &FileClass<'_>, config_dir: &Path) -> bool {
        match self {
            Matcher::Name(n) => file.name == *n,
            Matcher::Prefix(p) => file.name.starts_with(p),
            Matcher::Suffix(s) => file.name.ends_with(s),
            Matcher::RemapPluginConfig => file.is_remap_plugin_config,
            Matcher::SslMaterial => {
                file.dir.file_name().map(|d| d == "ssl").unwrap_or(false)
                    && (file.name.ends_with(".cer") || file.name.ends_with(".key"))
            }
            Matcher::DirSuffix(s) => file.dir.to_string_lossy().ends_with(s),
            Matcher::UnderConfigDir => file.dir.starts_with(config_dir),
        }
    }
}

/// Disruption needed by one changed file
pub fn classify(file: &FileClass<'_>, config_dir: &Path) -> RestartData {
    RULES
        .iter()
        .find(|rule| rule.matcher.matches(file, config_dir))
        .map(|rule| rule.effect)
        .unwrap_or(RestartData::NONE)
}

pub fn classify_file(file: &ConfigFile, config_dir: &Path) -> RestartData {
    classify(
        &FileClass {
            name: &file.name,
            dir: &file.dir,
            is_remap_plugin_config: file.audit.is_remap_plugin_config,
        },
        config_dir,
    )
}
