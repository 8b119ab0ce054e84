use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read once from `RESERVD_*` environment variables.
/// Missing or unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub sweep_interval: Duration,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 3000,
            data_dir: PathBuf::from("./data"),
            sweep_interval: Duration::from_millis(1000),
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            bind: lookup("RESERVD_BIND").unwrap_or(defaults.bind),
            port: parse_with(&lookup, "RESERVD_PORT").unwrap_or(defaults.port),
            data_dir: lookup("RESERVD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            sweep_interval: parse_with::<u64>(&lookup, "RESERVD_SWEEP_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            compact_threshold: parse_with(&lookup, "RESERVD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parse_with(&lookup, "RESERVD_METRICS_PORT"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservd.wal")
    }
}

fn parse_with<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
