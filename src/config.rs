use std::path::PathBuf;
use std::time::Duration;

use crate::limits::MAX_ARMED_JOBS;

/// Daemon settings, read from `ESTATEBOOK_*` environment variables.
/// Unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub completion_grace: chrono::Duration,
    pub max_armed_jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            completion_grace: chrono::Duration::zero(),
            max_armed_jobs: MAX_ARMED_JOBS,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            data_dir: lookup("ESTATEBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: lookup("ESTATEBOOK_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            compact_threshold: parsed("ESTATEBOOK_COMPACT_THRESHOLD")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: parsed("ESTATEBOOK_SWEEP_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            completion_grace: parsed("ESTATEBOOK_COMPLETION_GRACE_SECS")
                .and_then(|n| i64::try_from(n).ok())
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(defaults.completion_grace),
            max_armed_jobs: parsed("ESTATEBOOK_MAX_ARMED_JOBS")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_armed_jobs),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("estatebook.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(Config::from_lookup(|_| None), Config::default());
        assert_eq!(Config::default().wal_path(), PathBuf::from("./data/estatebook.wal"));
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("ESTATEBOOK_DATA_DIR", "/var/lib/estatebook"),
            ("ESTATEBOOK_METRICS_PORT", "9184"),
            ("ESTATEBOOK_COMPACT_THRESHOLD", "50"),
            ("ESTATEBOOK_SWEEP_INTERVAL_SECS", "15"),
            ("ESTATEBOOK_COMPLETION_GRACE_SECS", "39600"),
            ("ESTATEBOOK_MAX_ARMED_JOBS", "10"),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/estatebook"));
        assert_eq!(config.metrics_port, Some(9184));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.completion_grace, chrono::Duration::hours(11));
        assert_eq!(config.max_armed_jobs, 10);
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/estatebook/estatebook.wal"));
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("ESTATEBOOK_METRICS_PORT", "not-a-port"),
            ("ESTATEBOOK_COMPACT_THRESHOLD", "-3"),
            ("ESTATEBOOK_SWEEP_INTERVAL_SECS", "0"),
        ]));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }
}
