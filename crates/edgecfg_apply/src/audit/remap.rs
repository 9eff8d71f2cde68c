//! Remap override resolution.
//!
//! A rule written as `##OVERRIDE## map /a /b` wins over every other rule
//! with the same source (`/a`), wherever that rule appears. The winning rule
//! is emitted after a bare `##OVERRIDE##` marker line, the losers are kept in
//! place but prefixed with `##OVERRIDDEN## `, and all other lines are
//! untouched and stay in order.

use std::collections::HashSet;

pub const OVERRIDE_MARKER: &str = "##OVERRIDE##";
pub const OVERRIDDEN_MARKER: &str = "##OVERRIDDEN##";

/// Rewrite a remap body. Returns `None` when it carries no overrides.
pub fn resolve_overrides(body: &str) -> Option<String> {
    let lines: Vec<&str> = body.lines().collect();

    let mut targets: HashSet<&str> = HashSet::new();
    for line in &lines {
        if let Some(rule) = line.trim_start().strip_prefix(OVERRIDE_MARKER) {
            let fields: Vec<&str> = rule.split_whitespace().collect();
            if fields.len() >= 2 {
                targets.insert(fields[1]);
            }
        }
    }
    if targets.is_empty() {
        return None;
    }

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + targets.len());
    for line in &lines {
        let trimmed = line.trim_start();
        if let Some(rule) = trimmed.strip_prefix(OVERRIDE_MARKER) {
            out.push(OVERRIDE_MARKER.to_string());
            out.push(rule.trim().to_string());
            continue;
        }
        if !trimmed.starts_with('#') {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() >= 2 && targets.contains(fields[1]) {
                out.push(format!("{} {}", OVERRIDDEN_MARKER, line));
                continue;
            }
        }
        out.push(line.to_string());
    }

    let mut rewritten = out.join("\n");
    rewritten.push('\n');
    Some(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_marks_later_rule() {
        let body = "##OVERRIDE## map /a /b\nmap /a /c\n";
        let out = resolve_overrides(body).unwrap();
        assert_eq!(out, "##OVERRIDE##\nmap /a /b\n##OVERRIDDEN## map /a /c\n");
    }

    #[test]
    fn test_override_marks_earlier_rule_and_keeps_order() {
        let body = "map /z /y\nmap /a /c\n# comment\n##OVERRIDE## map /a /b\nmap /q /r";
        let out = resolve_overrides(body).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "map /z /y",
                "##OVERRIDDEN## map /a /c",
                "# comment",
                "##OVERRIDE##",
                "map /a /b",
                "map /q /r",
            ]
        );
    }

    #[test]
    fn test_no_override_leaves_body_alone() {
        assert!(resolve_overrides("map /a /b\nmap /a /c\n").is_none());
        assert!(resolve_overrides("").is_none());
    }

    #[test]
    fn test_comments_never_marked() {
        let body = "##OVERRIDE## map /a /b\n# map /a /old\n";
        let out = resolve_overrides(body).unwrap();
        assert!(out.contains("\n# map /a /old\n"));
        assert!(!out.contains(OVERRIDDEN_MARKER));
    }

    #[test]
    fn test_short_lines_untouched() {
        let body = "##OVERRIDE## map /a /b\n.include x\n\n";
        let out = resolve_overrides(body).unwrap();
        assert!(out.contains(".include x"));
    }
}
