use anyhow::{bail, Context, Result};
use btsync_bluez::DEFAULT_BLUETOOTH_DIR;
use btsync_host_linux::DEFAULT_HEURISTIC_MIN_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SURVEY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SERVICE_UNIT: &str = "bluetooth";

/// How to choose among several partitions that carry a `Windows` directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Best-ranked partition with a `Windows` directory wins.
    #[default]
    FirstMatch,
    /// Fail unless exactly one partition carries a `Windows` directory.
    RequireUnique,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub bluetooth_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub survey_timeout_secs: u64,
    pub heuristic_min_size_bytes: u64,
    pub selection: SelectionPolicy,
    pub service_unit: String,
    pub manage_service: bool,
    pub dry_run: bool,
    pub report_base: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bluetooth_dir: PathBuf::from(DEFAULT_BLUETOOTH_DIR),
            backup_dir: default_backup_dir(),
            survey_timeout_secs: DEFAULT_SURVEY_TIMEOUT_SECS,
            heuristic_min_size_bytes: DEFAULT_HEURISTIC_MIN_SIZE,
            selection: SelectionPolicy::default(),
            service_unit: DEFAULT_SERVICE_UNIT.to_string(),
            manage_service: true,
            dry_run: false,
            report_base: None,
        }
    }
}

impl SyncConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(data).context("parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.survey_timeout_secs == 0 {
            bail!("survey_timeout_secs must be greater than zero");
        }
        if self.service_unit.trim().is_empty() {
            bail!("service_unit must not be empty");
        }
        Ok(())
    }

    pub fn survey_timeout(&self) -> Duration {
        Duration::from_secs(self.survey_timeout_secs)
    }
}

fn default_backup_dir() -> PathBuf {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".bt_sync_backup")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = SyncConfig::from_json("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.bluetooth_dir, PathBuf::from("/var/lib/bluetooth"));
        assert_eq!(config.survey_timeout(), Duration::from_secs(30));
        assert_eq!(config.selection, SelectionPolicy::FirstMatch);
        assert!(config.backup_dir.ends_with(".bt_sync_backup"));
        assert!(config.manage_service);
    }

    #[test]
    fn overrides_fields() {
        let config = SyncConfig::from_json(
            r#"{"selection": "require-unique", "dry_run": true, "survey_timeout_secs": 5,
                "bluetooth_dir": "/tmp/bt", "report_base": "/tmp/out"}"#,
        )
        .unwrap();
        assert_eq!(config.selection, SelectionPolicy::RequireUnique);
        assert!(config.dry_run);
        assert_eq!(config.survey_timeout_secs, 5);
        assert_eq!(config.report_base, Some(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn rejects_unknown_and_invalid_fields() {
        assert!(SyncConfig::from_json(r#"{"bogus": 1}"#).is_err());
        assert!(SyncConfig::from_json(r#"{"survey_timeout_secs": 0}"#).is_err());
        assert!(SyncConfig::from_json(r#"{"selection": "random"}"#).is_err());
    }

    #[test]
    fn loads_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bt-sync.json");
        std::fs::write(&path, r#"{"service_unit": "bluetooth.service"}"#).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap().service_unit, "bluetooth.service");
        assert!(SyncConfig::load(temp.path().join("missing.json")).is_err());
    }
}
