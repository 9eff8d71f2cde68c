//! Log-tail confirmation.
//!
//! A cursor is placed at the end of the diagnostics log *before* the
//! service command runs, then polled for the completion marker. Only lines
//! written after the cursor count.

use regex::Regex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    TimedOut,
    Skipped,
}

impl Confirmation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confirmation::Confirmed => "confirmed",
            Confirmation::TimedOut => "timed out",
            Confirmation::Skipped => "skipped",
        }
    }
}

#[derive(Debug)]
pub struct LogCursor {
    path: PathBuf,
    offset: u64,
    /// Bytes after the last newline, decoded once the line completes
    partial: Vec<u8>,
}

impl LogCursor {
    /// Start at the current end of `path`. A missing log starts at zero.
    pub fn at_end(path: &Path) -> Self {
        let offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            offset,
            partial: Vec::new(),
        }
    }

    /// Complete lines appended since the last read
    fn read_new_lines(&mut self) -> Vec<String> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len < self.offset {
            debug!("{} was truncated, rewinding", self.path.display());
            self.offset = 0;
            self.partial.clear();
        }
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }
        let mut buf = Vec::new();
        let read = match file.read_to_end(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("reading {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };
        self.offset += read as u64;
        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }

    /// Poll until a new line matches `pattern` or `timeout` passes
    pub fn wait_for(&mut self, pattern: &Regex, timeout: Duration, poll: Duration) -> Confirmation {
        let start = Instant::now();
        loop {
            if let Some(line) = self.read_new_lines().into_iter().find(|l| pattern.is_match(l)) {
                debug!("matched: {}", line);
                return Confirmation::Confirmed;
            }
            if start.elapsed() >= timeout {
                return Confirmation::TimedOut;
            }
            thread::sleep(poll);
        }
    }
}

/// Pattern for a literal marker
pub fn marker_pattern(marker: &str) -> Result<Regex, regex::Error> {
    Regex::new(&regex::escape(marker))
}
