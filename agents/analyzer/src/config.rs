//! Configuration for the analyzer agent.

use anyhow::{ensure, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub channel: ChannelConfig,
    pub run: RunConfig,
    pub package: PackageConfig,
    pub injector: InjectorConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

/// Local command channel the monitored processes connect to.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub path: PathBuf,
    #[serde(default = "default_socket_mode")]
    pub mode: u32,
    #[serde(default = "default_max_accept_errors")]
    pub max_consecutive_accept_errors: u32,
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageConfig {
    pub name: String,
    #[serde(default)]
    pub target: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub pids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectorMode {
    /// Register announced processes without attaching anything.
    Track,
    /// Run an external injector program for every announced process.
    Command,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InjectorConfig {
    pub mode: InjectorMode,
    #[serde(default)]
    pub command: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub require_root: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CollectorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReportConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_socket_mode() -> u32 {
    0o666
}

fn default_max_accept_errors() -> u32 {
    16
}

fn default_accept_backoff_ms() -> u64 {
    100
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_endpoint() -> String {
    "http://localhost:4317".to_string()
}

impl RunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ChannelConfig {
    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("channel.path", "/tmp/analyzer/analyzer.sock")?
            .set_default("channel.mode", default_socket_mode())?
            .set_default("run.timeout_secs", default_timeout_secs())?
            .set_default("run.poll_interval_ms", default_poll_interval_ms())?
            .set_default("package.name", "exe")?
            .set_default("injector.mode", "track")?
            .set_default("paths.root", "/tmp/analyzer")?
            .set_default("paths.folders", vec!["logs", "files"])?
            .set_default("paths.require_root", false)?
            .set_default("collector.enabled", false)?
            .set_default("collector.endpoint", default_endpoint())?
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("ANALYZER")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.run.poll_interval_ms > 0,
            "run.poll_interval_ms must be greater than zero"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_without_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load(&tmp.path().join("missing.yaml")).unwrap();

        assert_eq!(config.channel.path, PathBuf::from("/tmp/analyzer/analyzer.sock"));
        assert_eq!(config.run.timeout(), Duration::from_secs(120));
        assert_eq!(config.run.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.package.name, "exe");
        assert_eq!(config.injector.mode, InjectorMode::Track);
        assert_eq!(config.paths.folders, vec!["logs", "files"]);
        assert!(!config.collector.enabled);
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("agent.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "run:\n  timeout_secs: 30\npackage:\n  name: observe\n  pids: [10, 20]\ninjector:\n  mode: command\n  command: /opt/inject\n  args: [\"--pid\", \"{{pid}}\"]"
        )
        .unwrap();

        let config = Config::load(&path).unwrap();

        assert_eq!(config.run.timeout_secs, 30);
        assert_eq!(config.run.poll_interval_ms, 1000);
        assert_eq!(config.package.name, "observe");
        assert_eq!(config.package.pids, vec![10, 20]);
        assert_eq!(config.injector.mode, InjectorMode::Command);
        assert_eq!(config.injector.command, Some(PathBuf::from("/opt/inject")));
        assert_eq!(config.injector.args, vec!["--pid", "{pid}"]);
    }

    #[test]
    fn test_load_rejects_zero_poll_interval() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("agent.yaml");
        std::fs::write(&path, "run:\n  poll_interval_ms: 0\n").unwrap();

        let err = Config::load(&path).unwrap_err();

        assert!(err.to_string().contains("poll_interval_ms"), "{err}");
    }
}
