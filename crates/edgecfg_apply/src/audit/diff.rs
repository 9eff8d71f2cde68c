//! Semantic diff between the desired body and the file on disk.
//!
//! Both sides are normalised before comparing: line endings unified, blank
//! and `#` comment lines dropped, runs of whitespace collapsed, and the
//! `&amp;` `&lt;` `&gt;` entities the generator may emit decoded. A change
//! that only touches comments or spacing is therefore not a change.

use crate::config_file::ConfigFile;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

/// Differences found for one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDiff {
    /// File does not exist yet
    pub missing: bool,
    pub content_changed: bool,
    pub mode_changed: bool,
    pub owner_changed: bool,
    /// `-old` / `+new` normalised lines, for reporting
    pub lines: Vec<String>,
}

impl FileDiff {
    pub fn any(&self) -> bool {
        self.missing || self.content_changed || self.mode_changed || self.owner_changed
    }
}

fn normalize_line(line: &str) -> String {
    line.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

/// Comparable form of a config body
pub fn normalize(body: &str) -> Vec<String> {
    body.replace("\r\n", "\n")
        .trim()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(normalize_line)
        .collect()
}

/// Removed and added lines between two normalised bodies, order preserved
fn line_changes(current: &[String], desired: &[String]) -> Vec<String> {
    let current_set: HashSet<&String> = current.iter().collect();
    let desired_set: HashSet<&String> = desired.iter().collect();
    let removed = current
        .iter()
        .filter(|l| !desired_set.contains(l))
        .map(|l| format!("-{}", l));
    let added = desired
        .iter()
        .filter(|l| !current_set.contains(l))
        .map(|l| format!("+{}", l));
    removed.chain(added).collect()
}

/// Compare a config file's desired state with disk
pub fn diff_file(file: &ConfigFile) -> io::Result<FileDiff> {
    let desired = normalize(&file.body);

    let meta = match fs::metadata(&file.path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(FileDiff {
                missing: true,
                lines: desired.iter().map(|l| format!("+{}", l)).collect(),
                ..Default::default()
            });
        }
        Err(e) => return Err(e),
    };

    // bytes that do not decode become U+FFFD and so never match the desired body
    let raw = fs::read(&file.path)?;
    let current = normalize(&String::from_utf8_lossy(&raw));
    let lines = if current == desired {
        Vec::new()
    } else {
        line_changes(&current, &desired)
    };

    Ok(FileDiff {
        missing: false,
        content_changed: current != desired,
        mode_changed: meta.permissions().mode() & 0o7777 != file.mode,
        owner_changed: meta.uid() != file.uid || meta.gid() != file.gid,
        lines,
    })
}
