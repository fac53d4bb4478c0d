//! Configuration for nzbprobe
//!
//! A single YAML file configures the download providers and, for scanning
//! mode, the watch directories, rate limits and queue location. Defaults are
//! merged in after deserialization so that a minimal file stays minimal.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProbeError, Result};

/// Fallback fetch concurrency when no provider advertises connections.
const DEFAULT_DOWNLOAD_WORKERS: usize = 10;

/// One Usenet provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Connection ceiling for this provider; also feeds the
    /// `download_workers` default.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_port() -> u16 {
    119
}

fn default_max_connections() -> usize {
    10
}

/// Scanner (continuous mode) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub watch_directories: Vec<PathBuf>,

    /// Seconds between directory scans.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Verification attempts allowed per local day.
    #[serde(default = "default_max_files_per_day")]
    pub max_files_per_day: u32,

    /// Number of verification workers.
    #[serde(default = "default_concurrent_jobs")]
    pub concurrent_jobs: usize,

    /// Path to the SQLite queue database.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Seconds after which a processed item becomes eligible again.
    /// Zero disables reprocessing.
    #[serde(default)]
    pub reprocess_interval_secs: u64,

    /// Where failed NZB files are moved. Unset disables quarantine.
    #[serde(default)]
    pub failed_directory: Option<PathBuf>,

    /// Percentage of each file's segments to fetch, in (0, 100].
    #[serde(default = "default_check_percent")]
    pub check_percent: u8,

    /// Tolerated missing percentage over the whole manifest, in [0, 100].
    #[serde(default)]
    pub missing_percent: u8,
}

fn default_scan_interval_secs() -> u64 {
    30 * 60
}

fn default_max_files_per_day() -> u32 {
    50
}

fn default_concurrent_jobs() -> usize {
    1
}

fn default_database_path() -> PathBuf {
    PathBuf::from("queue.db")
}

fn default_check_percent() -> u8 {
    100
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            watch_directories: Vec::new(),
            scan_interval_secs: default_scan_interval_secs(),
            max_files_per_day: default_max_files_per_day(),
            concurrent_jobs: default_concurrent_jobs(),
            database_path: default_database_path(),
            reprocess_interval_secs: 0,
            failed_directory: None,
            check_percent: default_check_percent(),
            missing_percent: 0,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Fetch concurrency inside one verification. Zero means derive it from
    /// the providers' `max_connections` sum (falling back to 10).
    #[serde(default)]
    pub download_workers: usize,

    #[serde(default)]
    pub download_providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub scanner: ScannerConfig,
}

impl Config {
    /// Load configuration from a YAML file and merge defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProbeError::Config(format!("{}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ProbeError::Config(format!("{}: {e}", path.display())))?;
        Ok(config.finalize())
    }

    fn finalize(mut self) -> Self {
        if self.download_workers == 0 {
            let from_providers: usize = self
                .download_providers
                .iter()
                .map(|p| p.max_connections)
                .sum();
            self.download_workers = if from_providers > 0 {
                from_providers
            } else {
                DEFAULT_DOWNLOAD_WORKERS
            };
        }
        if self.scanner.concurrent_jobs == 0 {
            self.scanner.concurrent_jobs = default_concurrent_jobs();
        }
        self
    }

    /// Check the invariants scanning mode refuses to start without.
    pub fn validate_for_scan(&self) -> Result<()> {
        if !self.scanner.enabled {
            return Err(ProbeError::Config(
                "scanner is not enabled in config".to_string(),
            ));
        }
        if self.scanner.watch_directories.is_empty() {
            return Err(ProbeError::Config(
                "no watch directories configured".to_string(),
            ));
        }
        self.validate_percents()
    }

    /// Percent bounds shared by one-shot and scanning mode.
    pub fn validate_percents(&self) -> Result<()> {
        if self.scanner.check_percent == 0 || self.scanner.check_percent > 100 {
            return Err(ProbeError::Config(
                "check_percent must be between 1 and 100".to_string(),
            ));
        }
        if self.scanner.missing_percent > 100 {
            return Err(ProbeError::Config(
                "missing_percent must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scanner.scan_interval_secs)
    }

    /// `None` when reprocessing is disabled.
    pub fn reprocess_interval(&self) -> Option<Duration> {
        match self.scanner.reprocess_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        let cfg = cfg.finalize();

        assert_eq!(cfg.download_workers, 10);
        assert!(!cfg.scanner.enabled);
        assert_eq!(cfg.scanner.scan_interval_secs, 1800);
        assert_eq!(cfg.scanner.max_files_per_day, 50);
        assert_eq!(cfg.scanner.concurrent_jobs, 1);
        assert_eq!(cfg.scanner.database_path, PathBuf::from("queue.db"));
        assert!(cfg.reprocess_interval().is_none());
        assert_eq!(cfg.scanner.check_percent, 100);
        assert_eq!(cfg.scanner.missing_percent, 0);
    }

    #[test]
    fn download_workers_default_sums_provider_connections() {
        let yaml = r#"
download_providers:
  - host: news.example.com
    max_connections: 8
  - host: backup.example.com
    max_connections: 4
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let cfg = cfg.finalize();
        assert_eq!(cfg.download_workers, 12);
        assert_eq!(cfg.download_providers[0].port, 119);
    }

    #[test]
    fn explicit_download_workers_wins() {
        let yaml = r#"
download_workers: 3
download_providers:
  - host: news.example.com
    max_connections: 50
"#;
        let cfg: Config = serde_yaml::from_str::<Config>(yaml).unwrap().finalize();
        assert_eq!(cfg.download_workers, 3);
    }

    #[test]
    fn scan_validation_rejects_disabled_scanner() {
        let cfg = Config::default().finalize();
        assert!(matches!(
            cfg.validate_for_scan(),
            Err(ProbeError::Config(_))
        ));
    }

    #[test]
    fn scan_validation_rejects_bad_percents() {
        let mut cfg = Config::default().finalize();
        cfg.scanner.enabled = true;
        cfg.scanner.watch_directories = vec![PathBuf::from("/watch")];

        cfg.scanner.check_percent = 0;
        assert!(cfg.validate_for_scan().is_err());

        cfg.scanner.check_percent = 101;
        assert!(cfg.validate_for_scan().is_err());

        cfg.scanner.check_percent = 10;
        cfg.scanner.missing_percent = 101;
        assert!(cfg.validate_for_scan().is_err());

        cfg.scanner.missing_percent = 100;
        assert!(cfg.validate_for_scan().is_ok());
    }

    #[test]
    fn reprocess_interval_zero_disables() {
        let yaml = r#"
scanner:
  reprocess_interval_secs: 604800
"#;
        let cfg: Config = serde_yaml::from_str::<Config>(yaml).unwrap().finalize();
        assert_eq!(
            cfg.reprocess_interval(),
            Some(Duration::from_secs(7 * 24 * 3600))
        );
    }
}
