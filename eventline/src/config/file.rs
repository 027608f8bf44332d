//! INI configuration file.
//!
//! ```ini
//! [pipeline]
//! max_batch_count = 100
//! max_batch_size = 512KB
//! max_latency_ms = 2000
//! retry_ceiling = 5
//! backoff = E,3000,300000,2,0.2
//! metered = high,immediate
//!
//! [storage]
//! path = ~/.local/share/eventline/events.db
//! quota = 16MB
//! memory_fallback = true
//! stale_in_flight_secs = 60
//!
//! [transport]
//! endpoint = https://collector.example.com/v1/events
//! api_key = ...
//! compression = deflate:6
//! timeout_secs = 30
//!
//! [logging]
//! level = info
//! directory = ~/.local/state/eventline
//! ```
//!
//! Missing sections and keys keep their defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use super::PipelineConfig;
use crate::compression::Compression;
use crate::connectivity::MeteredPolicy;
use crate::error::PipelineError;
use crate::logging::LoggingConfig;
use crate::record::Priority;
use crate::transport::BackoffPolicy;

const SECTION_PIPELINE: &str = "pipeline";
const SECTION_STORAGE: &str = "storage";
const SECTION_TRANSPORT: &str = "transport";
const SECTION_LOGGING: &str = "logging";

/// Errors loading or saving a config file.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid INI syntax: {0}")]
    Parse(String),

    #[error("Invalid value for [{section}] {key} = '{value}': {reason}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("No platform configuration directory")]
    NoConfigDir,
}

impl From<ConfigFileError> for PipelineError {
    fn from(e: ConfigFileError) -> Self {
        PipelineError::Config(e.to_string())
    }
}

/// Collector settings from `[transport]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

/// Parsed config file.
#[derive(Clone, Debug)]
pub struct ConfigFile {
    pub pipeline: PipelineConfig,
    pub transport: TransportSettings,
    pub logging: LoggingConfig,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default().with_storage_path(default_storage_path()),
            transport: TransportSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// `<config dir>/eventline/config.ini`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("eventline").join("config.ini"))
}

/// `<local data dir>/eventline/events.db`.
fn default_storage_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("eventline").join("events.db"))
}

impl ConfigFile {
    /// Load from the default location, or defaults if there is no file.
    pub fn load() -> Result<Self, ConfigFileError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from `path`, which must exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ini_str(&text)
    }

    pub fn from_ini_str(text: &str) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigFileError::Parse(e.to_string()))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigFileError> {
        let mut config = Self::default();
        let p = &mut config.pipeline;

        if let Some(v) = parse_value::<usize>(ini, SECTION_PIPELINE, "max_batch_count")? {
            p.max_batch_count = v;
        }
        if let Some(v) = read(ini, SECTION_PIPELINE, "max_batch_size") {
            p.max_batch_bytes = parse_size(v)
                .ok_or_else(|| invalid(SECTION_PIPELINE, "max_batch_size", v, "expected a size like 512KB"))?;
        }
        if let Some(ms) = parse_value::<u64>(ini, SECTION_PIPELINE, "max_latency_ms")? {
            p.max_latency = Duration::from_millis(ms);
        }
        if let Some(v) = parse_value::<u32>(ini, SECTION_PIPELINE, "retry_ceiling")? {
            p.retry_ceiling = v;
        }
        if let Some(v) = read(ini, SECTION_PIPELINE, "backoff") {
            p.backoff = BackoffPolicy::from_config_str(v)
                .map_err(|reason| invalid(SECTION_PIPELINE, "backoff", v, &reason))?;
        }
        if let Some(v) = read(ini, SECTION_PIPELINE, "metered") {
            p.allow_metered_transmission = parse_metered(v)
                .ok_or_else(|| invalid(SECTION_PIPELINE, "metered", v, "expected none, all or a priority list"))?;
        }
        if let Some(ms) = parse_value::<u64>(ini, SECTION_PIPELINE, "tick_interval_ms")? {
            p.tick_interval = Duration::from_millis(ms);
        }

        if let Some(v) = read(ini, SECTION_STORAGE, "path") {
            p.storage_path = match v {
                "" | ":memory:" => None,
                path => Some(expand_home(path)),
            };
        }
        if let Some(v) = read(ini, SECTION_STORAGE, "quota") {
            p.storage_quota_bytes = parse_size(v)
                .ok_or_else(|| invalid(SECTION_STORAGE, "quota", v, "expected a size like 16MB"))?;
        }
        if let Some(v) = read(ini, SECTION_STORAGE, "memory_fallback") {
            p.memory_fallback = parse_bool(v)
                .ok_or_else(|| invalid(SECTION_STORAGE, "memory_fallback", v, "expected true or false"))?;
        }
        if let Some(secs) = parse_value::<u64>(ini, SECTION_STORAGE, "stale_in_flight_secs")? {
            p.stale_in_flight_timeout = Duration::from_secs(secs);
        }

        if let Some(v) = read(ini, SECTION_TRANSPORT, "compression") {
            p.compression = Compression::parse(v)
                .ok_or_else(|| invalid(SECTION_TRANSPORT, "compression", v, "expected none or deflate[:0-9]"))?;
        }
        if let Some(secs) = parse_value::<u64>(ini, SECTION_TRANSPORT, "timeout_secs")? {
            p.send_timeout = Duration::from_secs(secs);
        }
        config.transport.endpoint = read(ini, SECTION_TRANSPORT, "endpoint")
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        config.transport.api_key = read(ini, SECTION_TRANSPORT, "api_key")
            .filter(|v| !v.is_empty())
            .map(str::to_owned);

        if let Some(v) = read(ini, SECTION_LOGGING, "level") {
            config.logging.level = v.to_string();
        }
        if let Some(v) = read(ini, SECTION_LOGGING, "directory") {
            config.logging.directory = (!v.is_empty()).then(|| expand_home(v));
        }
        if let Some(v) = read(ini, SECTION_LOGGING, "file_prefix") {
            config.logging.file_prefix = v.to_string();
        }

        config
            .pipeline
            .validate()
            .map_err(|e| ConfigFileError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Runtime configuration for [`crate::pipeline::Pipeline::start`].
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        self.pipeline.clone()
    }

    /// Render as INI.
    pub fn to_ini(&self) -> Ini {
        let p = &self.pipeline;
        let mut ini = Ini::new();
        ini.with_section(Some(SECTION_PIPELINE))
            .set("max_batch_count", p.max_batch_count.to_string())
            .set("max_batch_size", p.max_batch_bytes.to_string())
            .set("max_latency_ms", p.max_latency.as_millis().to_string())
            .set("retry_ceiling", p.retry_ceiling.to_string())
            .set(
                "backoff",
                format!(
                    "E,{},{},{},{}",
                    p.backoff.base_delay().as_millis(),
                    p.backoff.max_delay().as_millis(),
                    p.backoff.multiplier(),
                    p.backoff.jitter()
                ),
            )
            .set("metered", format_metered(&p.allow_metered_transmission))
            .set("tick_interval_ms", p.tick_interval.as_millis().to_string());
        ini.with_section(Some(SECTION_STORAGE))
            .set(
                "path",
                p.storage_path
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| ":memory:".to_string()),
            )
            .set("quota", p.storage_quota_bytes.to_string())
            .set("memory_fallback", p.memory_fallback.to_string())
            .set(
                "stale_in_flight_secs",
                p.stale_in_flight_timeout.as_secs().to_string(),
            );
        ini.with_section(Some(SECTION_TRANSPORT))
            .set("endpoint", self.transport.endpoint.clone().unwrap_or_default())
            .set("api_key", self.transport.api_key.clone().unwrap_or_default())
            .set("compression", p.compression.to_string())
            .set("timeout_secs", p.send_timeout.as_secs().to_string());
        ini.with_section(Some(SECTION_LOGGING))
            .set("level", self.logging.level.clone())
            .set(
                "directory",
                self.logging
                    .directory
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_default(),
            )
            .set("file_prefix", self.logging.file_prefix.clone());
        ini
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigFileError> {
        let write_err = |source| ConfigFileError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        self.to_ini().write_to_file(path).map_err(write_err)
    }
}

fn read<'a>(ini: &'a Ini, section: &'static str, key: &'static str) -> Option<&'a str> {
    ini.get_from(Some(section), key).map(str::trim)
}

fn parse_value<T>(
    ini: &Ini,
    section: &'static str,
    key: &'static str,
) -> Result<Option<T>, ConfigFileError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match read(ini, section, key) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(section, key, v, &e.to_string())),
    }
}

fn invalid(section: &'static str, key: &'static str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section,
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parse a byte size: `1024`, `512KB`, `16MB`, `1GiB`. Units are binary.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

fn parse_metered(value: &str) -> Option<MeteredPolicy> {
    match value.to_ascii_lowercase().as_str() {
        "none" | "" => return Some(MeteredPolicy::deny_all()),
        "all" => return Some(MeteredPolicy::allow_all()),
        _ => {}
    }
    let mut policy = MeteredPolicy::deny_all();
    for part in value.split(',') {
        match part.trim().parse::<Priority>().ok()? {
            Priority::Normal => policy.normal = true,
            Priority::High => policy.high = true,
            Priority::Immediate => policy.immediate = true,
        }
    }
    Some(policy)
}

fn format_metered(policy: &MeteredPolicy) -> String {
    let names: Vec<String> = Priority::ALL
        .into_iter()
        .filter(|p| policy.allows(*p))
        .map(|p| p.to_string())
        .collect();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(",")
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_keeps_defaults() {
        let config = ConfigFile::from_ini_str("").unwrap();
        let p = config.to_pipeline_config();
        assert_eq!(p.max_batch_count, 100);
        assert_eq!(p.retry_ceiling, 5);
        assert!(config.transport.endpoint.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_full_file() {
        let text = "\
[pipeline]
max_batch_count = 20
max_batch_size = 64KB
max_latency_ms = 500
retry_ceiling = 3
backoff = E,1000,60000,2,0.5
metered = all

[storage]
path = :memory:
quota = 2MB
memory_fallback = no
stale_in_flight_secs = 10

[transport]
endpoint = https://collector.example.com/v1/events
api_key = k
compression = none
timeout_secs = 5

[logging]
level = debug
directory = /var/log/eventline
";
        let config = ConfigFile::from_ini_str(text).unwrap();
        let p = config.to_pipeline_config();
        assert_eq!(p.max_batch_count, 20);
        assert_eq!(p.max_batch_bytes, 64 * 1024);
        assert_eq!(p.max_latency, Duration::from_millis(500));
        assert_eq!(p.retry_ceiling, 3);
        assert_eq!(p.backoff.base_delay(), Duration::from_secs(1));
        assert_eq!(p.allow_metered_transmission, MeteredPolicy::allow_all());
        assert!(p.storage_path.is_none());
        assert_eq!(p.storage_quota_bytes, 2 * 1024 * 1024);
        assert!(!p.memory_fallback);
        assert_eq!(p.stale_in_flight_timeout, Duration::from_secs(10));
        assert_eq!(p.compression, Compression::None);
        assert_eq!(p.send_timeout, Duration::from_secs(5));
        assert_eq!(
            config.transport.endpoint.as_deref(),
            Some("https://collector.example.com/v1/events")
        );
        assert_eq!(config.transport.api_key.as_deref(), Some("k"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.logging.directory,
            Some(PathBuf::from("/var/log/eventline"))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            "[pipeline]\nmax_batch_count = many",
            "[pipeline]\nbackoff = L,1,2,3,4",
            "[pipeline]\nmetered = sometimes",
            "[storage]\nquota = 12 parsecs",
            "[storage]\nmemory_fallback = maybe",
            "[transport]\ncompression = brotli",
        ];
        for text in cases {
            let err = ConfigFile::from_ini_str(text).unwrap_err();
            assert!(
                matches!(err, ConfigFileError::InvalidValue { .. }),
                "{}: {:?}",
                text,
                err
            );
        }
    }

    #[test]
    fn test_zero_batch_count_rejected() {
        let err = ConfigFile::from_ini_str("[pipeline]\nmax_batch_count = 0").unwrap_err();
        assert!(matches!(err, ConfigFileError::Parse(_)));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("512KB"), Some(512 * 1024));
        assert_eq!(parse_size("16 MB"), Some(16 * 1024 * 1024));
        assert_eq!(parse_size("1GiB"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("MB"), None);
        assert_eq!(parse_size("5 TB"), None);
    }

    #[test]
    fn test_parse_metered() {
        assert_eq!(parse_metered("none"), Some(MeteredPolicy::deny_all()));
        assert_eq!(parse_metered("high, immediate"), Some(MeteredPolicy::default()));
        assert_eq!(parse_metered("normal,bogus"), None);
        assert_eq!(
            parse_metered(&format_metered(&MeteredPolicy::default())),
            Some(MeteredPolicy::default())
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.ini");

        let mut config = ConfigFile::default();
        config.pipeline.max_batch_count = 42;
        config.pipeline.storage_path = Some(dir.path().join("events.db"));
        config.transport.endpoint = Some("http://localhost:8080/ingest".to_string());
        config.save(&path).unwrap();

        let loaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(loaded.pipeline.max_batch_count, 42);
        assert_eq!(loaded.pipeline.storage_path, Some(dir.path().join("events.db")));
        assert_eq!(loaded.pipeline.backoff, config.pipeline.backoff);
        assert_eq!(loaded.transport, config.transport);
        assert_eq!(loaded.logging, config.logging);
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigFile::load_from(Path::new("/nonexistent/eventline.ini")).unwrap_err();
        assert!(matches!(err, ConfigFileError::Read { .. }));
    }
}
