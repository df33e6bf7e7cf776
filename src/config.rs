// Scan configuration

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::scheduler::{default_worker_count, IsolationMode, ScannerOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One OS thread per job; a job stuck in blocking code keeps its
    /// worker busy past its timeout
    Thread,

    /// One child process per job
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Number of concurrent workers
    pub workers: usize,

    /// Per-job timeout in seconds, 0 disables it
    pub job_timeout_secs: u64,

    /// Timeout for each connectivity handshake in seconds
    pub network_timeout_secs: u64,

    /// How long drain waits for running jobs before cancelling them
    pub drain_grace_secs: u64,

    pub isolation: Isolation,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            job_timeout_secs: 60,
            network_timeout_secs: 5,
            drain_grace_secs: 10,
            isolation: Isolation::Process,
        }
    }
}

impl ScanConfig {
    /// Create config from a TOML file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: ScanConfig = toml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Write the default config as an example file
    pub fn create_example(path: impl AsRef<Path>) -> anyhow::Result<()> {
        let toml = toml::to_string_pretty(&Self::default())?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_secs > 0).then(|| Duration::from_secs(self.job_timeout_secs))
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs.max(1))
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    /// Scheduler options; process isolation re-executes the running binary.
    pub fn scanner_options(&self) -> anyhow::Result<ScannerOptions> {
        let isolation = match self.isolation {
            Isolation::Thread => IsolationMode::Thread,
            Isolation::Process => IsolationMode::Process {
                program: std::env::current_exe()
                    .context("cannot locate the running executable for process isolation")?,
            },
        };

        Ok(ScannerOptions::default()
            .with_workers(self.workers)
            .with_default_timeout(self.job_timeout())
            .with_isolation(isolation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_keys_keep_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "workers = 3\nisolation = \"process\"").unwrap();

        let config = ScanConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.isolation, Isolation::Process);
        assert_eq!(config.job_timeout_secs, ScanConfig::default().job_timeout_secs);
        assert_eq!(config.drain_grace(), Duration::from_secs(10));
    }

    #[test]
    fn example_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tlsaudit.toml");
        ScanConfig::create_example(&path).unwrap();
        assert_eq!(ScanConfig::from_file(&path).unwrap(), ScanConfig::default());
    }

    #[test]
    fn zero_job_timeout_disables_it() {
        let config = ScanConfig {
            job_timeout_secs: 0,
            ..ScanConfig::default()
        };
        assert_eq!(config.job_timeout(), None);
        assert_eq!(config.scanner_options().unwrap().default_timeout, None);
    }

    #[test]
    fn process_isolation_is_the_default() {
        let config = ScanConfig::default();
        assert_eq!(config.isolation, Isolation::Process);

        let options = config.scanner_options().unwrap();
        let IsolationMode::Process { program } = options.isolation else {
            panic!("expected process isolation, got {:?}", options.isolation);
        };
        assert_eq!(program, std::env::current_exe().unwrap());
    }

    #[test]
    fn thread_isolation_can_be_chosen() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "isolation = \"thread\"").unwrap();

        let config = ScanConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scanner_options().unwrap().isolation, IsolationMode::Thread);
    }

    #[test]
    fn bad_toml_is_reported() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "workers = \"many\"").unwrap();
        assert!(ScanConfig::from_file(file.path()).is_err());
    }
}
