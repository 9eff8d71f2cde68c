//! Desired config snapshot.
//!
//! The generator is an external tool that prints a JSON array of
//! `ConfigFileRecord`. An empty snapshot is valid and means no managed files.

use crate::error::GeneratorError;
use crate::exec::CommandRunner;
use edgecfg_common::{ApplyFiles, ConfigFileRecord};
use std::sync::{Arc, Mutex};
use tracing::info;

pub trait ConfigGenerator: Send + Sync {
    fn generate(&self, files: ApplyFiles) -> Result<Vec<ConfigFileRecord>, GeneratorError>;
}

pub struct CommandGenerator {
    runner: Arc<dyn CommandRunner>,
    generate_cmd: String,
    cache_host_name: String,
}

impl CommandGenerator {
    pub fn new(runner: Arc<dyn CommandRunner>, generate_cmd: &str, cache_host_name: &str) -> Self {
        Self {
            runner,
            generate_cmd: generate_cmd.to_string(),
            cache_host_name: cache_host_name.to_string(),
        }
    }
}

impl ConfigGenerator for CommandGenerator {
    fn generate(&self, files: ApplyFiles) -> Result<Vec<ConfigFileRecord>, GeneratorError> {
        let host = format!("--cache-host-name={}", self.cache_host_name);
        let scope = format!("--files={}", files.as_str());
        let out = self
            .runner
            .run(&self.generate_cmd, &[host.as_str(), scope.as_str()])
            .map_err(|e| GeneratorError::Command(e.to_string()))?;
        if !out.success() {
            return Err(GeneratorError::Command(out.reason()));
        }
        let records: Vec<ConfigFileRecord> =
            serde_json::from_str(&out.stdout).map_err(|e| GeneratorError::Parse(e.to_string()))?;
        info!("generator returned {} files", records.len());
        Ok(records)
    }
}

/// Returns a fixed snapshot, narrowed by scope the way the real generator does
#[derive(Debug, Clone, Default)]
pub struct FakeGenerator {
    records: Arc<Mutex<Vec<ConfigFileRecord>>>,
    fail: Arc<Mutex<bool>>,
}

impl FakeGenerator {
    pub fn new(records: Vec<ConfigFileRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
            fail: Arc::new(Mutex::new(false)),
        }
    }

    pub fn with_failure(self) -> Self {
        if let Ok(mut f) = self.fail.lock() {
            *f = true;
        }
        self
    }

    /// Replace the snapshot served by later runs
    pub fn set_records(&self, records: Vec<ConfigFileRecord>) {
        if let Ok(mut r) = self.records.lock() {
            *r = records;
        }
    }
}

impl ConfigGenerator for FakeGenerator {
    fn generate(&self, files: ApplyFiles) -> Result<Vec<ConfigFileRecord>, GeneratorError> {
        if self.fail.lock().map(|f| *f).unwrap_or(false) {
            return Err(GeneratorError::Command("scripted failure".to_string()));
        }
        let records = self
            .records
            .lock()
            .map_err(|_| GeneratorError::Command("fake state poisoned".to_string()))?
            .clone();
        Ok(match files {
            ApplyFiles::All => records,
            ApplyFiles::Reval => records
                .into_iter()
                .filter(|r| r.name == crate::fs_apply::REVAL_FILE)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, FakeCommandRunner};

    #[test]
    fn test_command_generator_parses_records() {
        let runner = FakeCommandRunner::new().with_response(
            "/usr/bin/edgecfg-generate",
            CommandOutput::ok(
                r#"[{"name":"remap.config","path":"/opt/trafficserver/etc/trafficserver","text":"map /a /b\n"},
                    {"name":"edge.key","path":"/opt/trafficserver/etc/trafficserver/ssl","text":"K","secure":true}]"#,
            ),
        );
        let generator = CommandGenerator::new(Arc::new(runner.clone()), "/usr/bin/edgecfg-generate", "edge-01");
        let records = generator.generate(ApplyFiles::All).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[1].secure);
        assert_eq!(
            runner.calls(),
            vec!["/usr/bin/edgecfg-generate --cache-host-name=edge-01 --files=all"]
        );
    }

    #[test]
    fn test_command_generator_failure() {
        let runner = FakeCommandRunner::new()
            .with_response("/usr/bin/edgecfg-generate", CommandOutput::fail(2, "no profile"));
        let generator = CommandGenerator::new(Arc::new(runner), "/usr/bin/edgecfg-generate", "edge-01");
        assert!(matches!(
            generator.generate(ApplyFiles::All),
            Err(GeneratorError::Command(_))
        ));
    }

    #[test]
    fn test_empty_snapshot_is_valid() {
        let runner = FakeCommandRunner::new()
            .with_response("/usr/bin/edgecfg-generate", CommandOutput::ok("[]"));
        let generator = CommandGenerator::new(Arc::new(runner), "/usr/bin/edgecfg-generate", "edge-01");
        assert!(generator.generate(ApplyFiles::Reval).unwrap().is_empty());
    }

    #[test]
    fn test_fake_reval_scope() {
        let fake = FakeGenerator::new(vec![
            ConfigFileRecord::new("remap.config", "/etc/ts", "x"),
            ConfigFileRecord::new("regex_revalidate.config", "/etc/ts", "y"),
        ]);
        let reval = fake.generate(ApplyFiles::Reval).unwrap();
        assert_eq!(reval.len(), 1);
        assert_eq!(reval[0].name, "regex_revalidate.config");
    }
}
