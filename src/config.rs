use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Schedule of the daemon mode.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DaemonConfig {
    #[serde(default = "DaemonConfig::default_bmu_interval", with = "humantime_serde")]
    pub bmu_interval: Duration,
    #[serde(default = "DaemonConfig::default_bms_interval", with = "humantime_serde")]
    pub bms_interval: Duration,
    #[serde(default = "DaemonConfig::default_log_interval", with = "humantime_serde")]
    pub log_interval: Duration,
    #[serde(
        default = "DaemonConfig::default_health_interval",
        with = "humantime_serde"
    )]
    pub health_interval: Duration,
    /// Directory of the log store files
    #[serde(default = "DaemonConfig::default_log_dir")]
    pub log_dir: PathBuf,
    /// Number of log entries in the snapshot
    #[serde(default = "DaemonConfig::default_recent_entries")]
    pub recent_entries: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bmu_interval: Self::default_bmu_interval(),
            bms_interval: Self::default_bms_interval(),
            log_interval: Self::default_log_interval(),
            health_interval: Self::default_health_interval(),
            log_dir: Self::default_log_dir(),
            recent_entries: Self::default_recent_entries(),
        }
    }
}

impl DaemonConfig {
    fn default_bmu_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_bms_interval() -> Duration {
        Duration::from_secs(600)
    }

    fn default_log_interval() -> Duration {
        Duration::from_secs(600)
    }

    fn default_health_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn default_log_dir() -> PathBuf {
        PathBuf::from("./logs")
    }

    fn default_recent_entries() -> usize {
        bydbox_lib::client::DEFAULT_RECENT_ENTRIES
    }

    pub const DEFAULT_CONFIG_FILE: &str = "bydbox.yaml";

    pub fn load(config_file_path: impl AsRef<Path>) -> Result<Self> {
        let config_file_path = config_file_path.as_ref();
        if !config_file_path.exists() {
            log::info!("Config file {config_file_path:?} not found, using defaults");
            return Ok(Self::default());
        }
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    pub fn log_json_file(&self) -> PathBuf {
        self.log_dir.join(bydbox_lib::client::LOG_JSON_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_config_test() {
        let config: DaemonConfig =
            serde_yaml::from_str("bmu_interval: 10s\nlog_dir: /var/lib/bydbox\n").unwrap();
        assert_eq!(config.bmu_interval, Duration::from_secs(10));
        assert_eq!(config.bms_interval, Duration::from_secs(600));
        assert_eq!(config.log_dir, PathBuf::from("/var/lib/bydbox"));
        assert_eq!(config.recent_entries, 20);
        assert_eq!(
            config.log_json_file(),
            PathBuf::from("/var/lib/bydbox/byd_log.json")
        );
    }

    #[test]
    fn load_test() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "health_interval: 2m\nrecent_entries: 5").unwrap();
        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.health_interval, Duration::from_secs(120));
        assert_eq!(config.recent_entries, 5);
        assert_eq!(config.bmu_interval, Duration::from_secs(30));
    }

    #[test]
    fn missing_file_test() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(dir.path().join("missing.yaml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn invalid_file_test() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bmu_interval: soon").unwrap();
        assert!(DaemonConfig::load(file.path()).is_err());
    }
}
