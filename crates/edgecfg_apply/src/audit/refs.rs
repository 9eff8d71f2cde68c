//! Plugin and parameter-file references in plugin.config and remap.config.
//!
//! A changed plugin.config or remap.config is only safe to apply when every
//! plugin it loads exists and every parameter file it names either exists on
//! disk or is part of the snapshot being written in this run.

use std::collections::BTreeSet;
use std::path::Path;

/// File suffixes that mark a plugin argument as a parameter file
const PARAM_FILE_SUFFIXES: &[&str] = &[".config", ".lua", ".yaml", ".yml", ".json"];

/// Plugins and parameter files referenced by one config file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginRefs {
    pub plugins: BTreeSet<String>,
    pub param_files: BTreeSet<String>,
}

fn is_param_file(arg: &str) -> bool {
    PARAM_FILE_SUFFIXES.iter().any(|s| arg.ends_with(s))
}

/// Strip `--flag=` style prefixes from a plugin argument
fn arg_value(arg: &str) -> &str {
    match arg.rsplit_once('=') {
        Some((_, v)) => v,
        None => arg,
    }
}

fn content_lines(body: &str) -> impl Iterator<Item = &str> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

/// plugin.config: `<plugin.so> [args...]` per line
pub fn plugin_config_refs(body: &str) -> PluginRefs {
    let mut refs = PluginRefs::default();
    for line in content_lines(body) {
        let mut fields = line.split_whitespace();
        if let Some(plugin) = fields.next() {
            refs.plugins.insert(plugin.to_string());
        }
        for arg in fields {
            let value = arg_value(arg);
            if is_param_file(value) {
                refs.param_files.insert(value.to_string());
            }
        }
    }
    refs
}

/// remap.config: `@plugin=<so>` and `@pparam=<arg>` tokens on rule lines
pub fn remap_config_refs(body: &str) -> PluginRefs {
    let mut refs = PluginRefs::default();
    for line in content_lines(body) {
        for token in line.split_whitespace() {
            if let Some(plugin) = token.strip_prefix("@plugin=") {
                refs.plugins.insert(plugin.to_string());
            } else if let Some(param) = token.strip_prefix("@pparam=") {
                let value = arg_value(param);
                if is_param_file(value) {
                    refs.param_files.insert(value.to_string());
                }
            }
        }
    }
    refs
}

/// File names of the parameter files that remap.config hands to its plugins
pub fn remap_plugin_config_names(remap_body: &str) -> BTreeSet<String> {
    remap_config_refs(remap_body)
        .param_files
        .iter()
        .filter_map(|p| Path::new(p).file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect()
}

/// Check every reference. Returns the list of missing ones.
pub fn missing_refs(
    refs: &PluginRefs,
    plugin_dir: &Path,
    config_dir: &Path,
    files_adding: &[String],
) -> Vec<String> {
    let mut missing = Vec::new();

    for plugin in &refs.plugins {
        let path = Path::new(plugin);
        let found = if path.is_absolute() {
            path.exists()
        } else {
            plugin_dir.join(path).exists()
        };
        if !found {
            missing.push(format!("plugin {}", plugin));
        }
    }

    for param in &refs.param_files {
        let path = Path::new(param);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let on_disk = if path.is_absolute() {
            path.exists()
        } else {
            config_dir.join(path).exists()
        };
        if !on_disk && !files_adding.iter().any(|f| *f == name || f == param) {
            missing.push(format!("parameter file {}", param));
        }
    }

    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_plugin_config_refs() {
        let body = "# comment\nstats_over_http.so\nheader_rewrite.so hdr_rw_global.config\n\
                    lua.so --enable-reload /opt/ts/etc/trafficserver/global.lua\n";
        let refs = plugin_config_refs(body);
        assert_eq!(refs.plugins.len(), 3);
        assert!(refs.plugins.contains("header_rewrite.so"));
        assert!(refs.param_files.contains("hdr_rw_global.config"));
        assert!(refs.param_files.contains("/opt/ts/etc/trafficserver/global.lua"));
        assert!(!refs.param_files.contains("--enable-reload"));
    }

    #[test]
    fn test_remap_config_refs() {
        let body = "map http://a/ http://b/ @plugin=header_rewrite.so @pparam=hdr_rw_ds1.config\n\
                    map http://c/ http://d/ @plugin=cachekey.so @pparam=--include-params=x \
                    @pparam=--config=cachekey_ds2.yaml\n";
        let refs = remap_config_refs(body);
        assert_eq!(
            refs.plugins.iter().cloned().collect::<Vec<_>>(),
            vec!["cachekey.so", "header_rewrite.so"]
        );
        assert!(refs.param_files.contains("hdr_rw_ds1.config"));
        assert!(refs.param_files.contains("cachekey_ds2.yaml"));
        assert_eq!(refs.param_files.len(), 2);
    }

    #[test]
    fn test_remap_plugin_config_names() {
        let body = "map a b @plugin=url_sig.so @pparam=/opt/ts/etc/trafficserver/url_sig_ds.config\n";
        let names = remap_plugin_config_names(body);
        assert!(names.contains("url_sig_ds.config"));
    }

    #[test]
    fn test_missing_refs() {
        let dir = TempDir::new().unwrap();
        let plugin_dir = dir.path().join("libexec");
        let config_dir = dir.path().join("etc");
        fs::create_dir_all(&plugin_dir).unwrap();
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(plugin_dir.join("header_rewrite.so"), "").unwrap();
        fs::write(config_dir.join("on_disk.config"), "").unwrap();

        let refs = plugin_config_refs(
            "header_rewrite.so on_disk.config\nheader_rewrite.so new.config\nmissing.so gone.config\n",
        );
        let missing = missing_refs(&refs, &plugin_dir, &config_dir, &["new.config".to_string()]);
        assert_eq!(missing, vec!["plugin missing.so", "parameter file gone.config"]);
    }
}
