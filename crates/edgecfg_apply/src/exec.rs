//! Command Runner v1.0
//!
//! Every external program (package manager, service manager, git, sysctl,
//! traffic_ctl, helper tools) is started through `CommandRunner`:
//! - `SystemCommandRunner` runs real processes
//! - `FakeCommandRunner` answers from a script and records every call

use std::collections::HashMap;
use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stderr if present, otherwise stdout, trimmed (for error messages)
    pub fn reason(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            format!("exit {}: {}", self.code, self.stdout.trim())
        } else {
            format!("exit {}: {}", self.code, err)
        }
    }
}

// ============================================================================
// Command Runner Trait
// ============================================================================

/// Runs external programs. `Err` means the program could not be started.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;

    /// Run with `input` written to stdin
    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> io::Result<CommandOutput>;
}

// ============================================================================
// System Command Runner (Production)
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        debug!("exec: {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> io::Result<CommandOutput> {
        debug!("exec (stdin {} bytes): {} {}", input.len(), program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ============================================================================
// Fake Command Runner (Testing)
// ============================================================================

/// Scripted runner. Responses are keyed by the full command line
/// ("program arg1 arg2"); the longest scripted prefix wins, and anything
/// unscripted succeeds with empty output.
#[derive(Debug, Clone, Default)]
pub struct FakeCommandRunner {
    responses: Arc<Mutex<HashMap<String, CommandOutput>>>,
    calls: Arc<Mutex<Vec<String>>>,
    inputs: Arc<Mutex<Vec<String>>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response for a command line or command-line prefix
    pub fn with_response(self, command_line: &str, output: CommandOutput) -> Self {
        self.set_response(command_line, output);
        self
    }

    pub fn set_response(&self, command_line: &str, output: CommandOutput) {
        if let Ok(mut map) = self.responses.lock() {
            map.insert(command_line.to_string(), output);
        }
    }

    /// Every command line run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Command lines starting with `prefix`
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Stdin payloads passed to `run_with_input`, in order
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().map(|i| i.clone()).unwrap_or_default()
    }

    fn respond(&self, line: String) -> CommandOutput {
        let response = self.responses.lock().ok().and_then(|map| {
            map.iter()
                .filter(|(key, _)| line == **key || line.starts_with(&format!("{} ", key)))
                .max_by_key(|(key, _)| key.len())
                .map(|(_, out)| out.clone())
        });
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line);
        }
        response.unwrap_or_default()
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

impl CommandRunner for FakeCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        Ok(self.respond(command_line(program, args)))
    }

    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> io::Result<CommandOutput> {
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(input.to_string());
        }
        Ok(self.respond(command_line(program, args)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_runner_captures_output() {
        let runner = SystemCommandRunner::new();
        let out = runner.run("sh", &["-c", "echo hi; echo oops >&2; exit 3"]).unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[test]
    fn test_system_runner_stdin() {
        let runner = SystemCommandRunner::new();
        let out = runner.run_with_input("cat", &[], "payload").unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "payload");
    }

    #[test]
    fn test_system_runner_missing_program() {
        let runner = SystemCommandRunner::new();
        assert!(runner.run("/nonexistent/program-xyz", &[]).is_err());
    }

    #[test]
    fn test_fake_longest_prefix_wins() {
        let fake = FakeCommandRunner::new()
            .with_response("rpm -q", CommandOutput::fail(1, "not installed"))
            .with_response("rpm -q trafficserver", CommandOutput::ok("trafficserver-9.2.1\n"));

        let hit = fake.run("rpm", &["-q", "trafficserver"]).unwrap();
        assert_eq!(hit.stdout.trim(), "trafficserver-9.2.1");

        let miss = fake.run("rpm", &["-q", "hitch"]).unwrap();
        assert_eq!(miss.code, 1);

        // "rpm -q" must not match "rpm -qa"
        let other = fake.run("rpm", &["-qa"]).unwrap();
        assert!(other.success());

        assert_eq!(fake.calls_matching("rpm -q ").len(), 2);
    }

    #[test]
    fn test_fake_records_inputs() {
        let fake = FakeCommandRunner::new();
        let view = fake.clone();
        fake.run_with_input("helper", &["update"], "{}").unwrap();
        assert_eq!(view.calls(), vec!["helper update"]);
        assert_eq!(view.inputs(), vec!["{}"]);
    }

    #[test]
    fn test_reason_prefers_stderr() {
        assert_eq!(CommandOutput::fail(2, " boom\n").reason(), "exit 2: boom");
        let out = CommandOutput {
            code: 1,
            stdout: "details".to_string(),
            stderr: String::new(),
        };
        assert_eq!(out.reason(), "exit 1: details");
    }
}
