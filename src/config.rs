use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Probe target used when `PROXY_PROBE_URL` is not set.
pub const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("XRAY_PATH is not set")]
    MissingXrayPath,
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("invalid port range {start}..{end}")]
    PortRange { start: u16, end: u16 },
}

/// Runtime options, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the xray binary launched once per test.
    pub xray_path: PathBuf,
    pub max_workers: usize,
    /// Per-config probe timeout.
    pub timeout: Duration,
    pub batch_size: usize,
    /// Persist each batch result file before starting the next batch.
    pub incremental_save: bool,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    pub start_port: u16,
    pub end_port: u16,
    pub max_memory_mb: u64,
    pub enable_metrics: bool,
    pub metrics_port: u16,
    pub probe_url: String,
    /// Window granted to in-flight tests after a shutdown signal.
    pub graceful_timeout: Duration,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let xray_path = get("XRAY_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or(SettingsError::MissingXrayPath)?;

        let data_dir = match get("PROXY_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir(),
        };
        let config_dir = get("PROXY_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("configs"));
        let log_dir = get("PROXY_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));

        let start_port = parse_or(&get, "PROXY_START_PORT", 10000)?;
        let end_port = parse_or(&get, "PROXY_END_PORT", 20000)?;
        if start_port >= end_port {
            return Err(SettingsError::PortRange {
                start: start_port,
                end: end_port,
            });
        }

        Ok(Settings {
            xray_path,
            max_workers: parse_or(&get, "PROXY_MAX_WORKERS", 100)?,
            timeout: Duration::from_secs(parse_or(&get, "PROXY_TIMEOUT", 3)?),
            batch_size: parse_or(&get, "PROXY_BATCH_SIZE", 100)?,
            incremental_save: parse_bool_or(&get, "PROXY_INCREMENTAL_SAVE", true)?,
            data_dir,
            config_dir,
            log_dir,
            start_port,
            end_port,
            max_memory_mb: parse_or(&get, "PROXY_MAX_MEMORY_MB", 1024)?,
            enable_metrics: parse_bool_or(&get, "PROXY_ENABLE_METRICS", false)?,
            metrics_port: parse_or(&get, "PROXY_METRICS_PORT", 8080)?,
            probe_url: get("PROXY_PROBE_URL").unwrap_or_else(|| DEFAULT_PROBE_URL.to_string()),
            graceful_timeout: Duration::from_secs(parse_or(&get, "PROXY_GRACEFUL_TIMEOUT", 10)?),
        })
    }

    /// Directory the per-batch result files are written to.
    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("working_json")
    }

    /// Create every directory the run needs. Failure here is fatal.
    pub fn prepare_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.results_dir())?;
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("proxyprobe"))
        .unwrap_or_else(|| PathBuf::from("proxyprobe-data"))
}

fn parse_or<T: std::str::FromStr>(
    get: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, SettingsError> {
    match get(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| SettingsError::Invalid { name, value }),
    }
}

fn parse_bool_or(
    get: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, SettingsError> {
    match get(name) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(SettingsError::Invalid { name, value }),
        },
    }
}
