use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "thermo-feed.json";

fn config_path() -> PathBuf {
    if let Ok(path) = env::var("THERMO_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Ok(state_dir) = env::var("THERMO_STATE_DIR") {
        let trimmed = state_dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join(DEFAULT_CONFIG_PATH);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

/// One configured sensor. `source` is the key readings arrive under (the MQTT
/// topic); everything else is display metadata.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub source: String,
    pub label: String,
    #[serde(default = "default_multiplier")]
    pub calibration_multiplier: Decimal,
    #[serde(default)]
    pub calibration_offset: Decimal,
    pub border_color: String,
    pub background_color: String,
}

fn default_multiplier() -> Decimal {
    Decimal::ONE
}

impl SourceConfig {
    pub fn new(source: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            label: label.into(),
            calibration_multiplier: Decimal::ONE,
            calibration_offset: Decimal::ZERO,
            border_color: "#3e95cd".to_string(),
            background_color: "#7bb6dd".to_string(),
        }
    }

    pub fn with_calibration(mut self, multiplier: Decimal, offset: Decimal) -> Self {
        self.calibration_multiplier = multiplier;
        self.calibration_offset = offset;
        self
    }

    /// `raw * multiplier + offset`, or `None` when the result overflows.
    pub fn calibrate(&self, raw: Decimal) -> Option<Decimal> {
        raw.checked_mul(self.calibration_multiplier)?
            .checked_add(self.calibration_offset)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FileConfig {
    #[serde(default)]
    pub(crate) application_name: Option<String>,
    #[serde(default)]
    pub(crate) database_url: Option<String>,
    #[serde(default)]
    pub(crate) mqtt_host: Option<String>,
    #[serde(default)]
    pub(crate) mqtt_port: Option<u16>,
    #[serde(default)]
    pub(crate) mqtt_username: Option<String>,
    #[serde(default)]
    pub(crate) mqtt_password: Option<String>,
    #[serde(default)]
    pub(crate) http_bind: Option<String>,
    #[serde(default)]
    pub(crate) idle_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub(crate) sources: Vec<SourceConfig>,
}

pub(crate) fn parse_file_config(bytes: &mut [u8]) -> Result<FileConfig> {
    let parsed: FileConfig =
        simd_json::serde::from_slice(bytes).context("invalid thermo-feed config file")?;
    Ok(parsed)
}

/// `Ok(None)` when nothing exists at `path`. Runs before tracing is set up,
/// so it does not log; the caller reports through [`Config::config_file`].
fn load_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut bytes = contents.into_bytes();
    parse_file_config(&mut bytes)
        .with_context(|| format!("failed to parse {}", path.display()))
        .map(Some)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub application_name: String,
    pub database_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub enable_mqtt_listener: bool,
    pub http_bind: String,
    pub max_queue: usize,
    pub flush_check_interval_ms: u64,
    pub sweep_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub cache_cleanup_interval_secs: u64,
    pub subscriber_send_timeout_ms: u64,
    pub otlp_endpoint: Option<String>,
    pub sources: Vec<SourceConfig>,
    pub config_file: ConfigFile,
}

/// Where the file layer of the configuration came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigFile {
    Loaded(PathBuf),
    Missing(PathBuf),
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mut config = Self::env_defaults();
        let path = config_path();
        match load_file_config(&path)? {
            Some(file) => {
                apply_file_overrides(&mut config, file, |key| env_value(key).is_none());
                config.config_file = ConfigFile::Loaded(path);
            }
            None => config.config_file = ConfigFile::Missing(path),
        }
        if let Err(err) = config.validate() {
            if let ConfigFile::Missing(path) = &config.config_file {
                return Err(err.context(format!("config file {} not found", path.display())));
            }
            return Err(err);
        }
        Ok(config)
    }

    fn env_defaults() -> Self {
        let mqtt_port = env_parse("THERMO_MQTT_PORT").unwrap_or(1883);
        Self {
            application_name: env_value("THERMO_APPLICATION_NAME")
                .unwrap_or_else(|| "Thermometer".to_string()),
            database_url: env_value("THERMO_DATABASE_URL")
                .or_else(|| env_value("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://data/thermo-feed.db".to_string()),
            mqtt_host: env_value("THERMO_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port,
            mqtt_username: env_value("THERMO_MQTT_USERNAME"),
            mqtt_password: env_value("THERMO_MQTT_PASSWORD"),
            mqtt_keepalive_secs: env_parse("THERMO_MQTT_KEEPALIVE_SECS").unwrap_or(30),
            mqtt_client_id: env_value("THERMO_MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("thermo-feed-{}", std::process::id())),
            enable_mqtt_listener: env_value("THERMO_ENABLE_MQTT")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            http_bind: env_value("THERMO_HTTP_BIND").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            max_queue: env_parse("THERMO_MAX_QUEUE").unwrap_or(1024),
            flush_check_interval_ms: env_parse("THERMO_FLUSH_CHECK_INTERVAL_MS").unwrap_or(1000),
            sweep_interval_secs: env_parse("THERMO_SWEEP_INTERVAL_SECS").unwrap_or(10),
            idle_timeout_secs: env_parse("THERMO_IDLE_TIMEOUT_SECS").unwrap_or(300),
            cache_cleanup_interval_secs: env_parse("THERMO_CACHE_CLEANUP_INTERVAL_SECS")
                .unwrap_or(300),
            subscriber_send_timeout_ms: env_parse("THERMO_SUBSCRIBER_SEND_TIMEOUT_MS")
                .unwrap_or(1000),
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
            sources: Vec::new(),
            config_file: ConfigFile::Missing(PathBuf::from(DEFAULT_CONFIG_PATH)),
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("no sources configured; add a \"sources\" list to the config file");
        }
        let mut seen = std::collections::HashSet::new();
        for source in &mut self.sources {
            source.source = source.source.trim().to_string();
            if source.source.is_empty() {
                bail!("source {:?} has an empty source key", source.label);
            }
            if !seen.insert(source.source.clone()) {
                bail!("source {:?} is configured more than once", source.source);
            }
            source.border_color = normalize_color(&source.border_color)
                .with_context(|| format!("invalid border_color for {}", source.label))?;
            source.background_color = normalize_color(&source.background_color)
                .with_context(|| format!("invalid background_color for {}", source.label))?;
        }
        if self.max_queue == 0 {
            self.max_queue = 1;
        }
        Ok(())
    }

    pub fn flush_check_interval(&self) -> Duration {
        Duration::from_millis(self.flush_check_interval_ms.max(1))
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_secs.max(1))
    }

    pub fn subscriber_send_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_send_timeout_ms)
    }
}

/// File values fill in anything the environment did not set explicitly.
/// `sources` only ever comes from the file.
pub(crate) fn apply_file_overrides(
    config: &mut Config,
    file: FileConfig,
    env_allows: impl Fn(&str) -> bool,
) {
    let non_empty = |value: Option<String>| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if env_allows("THERMO_APPLICATION_NAME") {
        if let Some(name) = non_empty(file.application_name) {
            config.application_name = name;
        }
    }
    if env_allows("THERMO_DATABASE_URL") && env_allows("DATABASE_URL") {
        if let Some(url) = non_empty(file.database_url) {
            config.database_url = url;
        }
    }
    if env_allows("THERMO_MQTT_HOST") {
        if let Some(host) = non_empty(file.mqtt_host) {
            config.mqtt_host = host;
        }
    }
    if env_allows("THERMO_MQTT_PORT") {
        if let Some(port) = file.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("THERMO_MQTT_USERNAME") {
        if let Some(username) = file.mqtt_username {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if env_allows("THERMO_MQTT_PASSWORD") {
        if let Some(password) = file.mqtt_password {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if env_allows("THERMO_HTTP_BIND") {
        if let Some(bind) = non_empty(file.http_bind) {
            config.http_bind = bind;
        }
    }
    if env_allows("THERMO_IDLE_TIMEOUT_SECS") {
        if let Some(value) = file.idle_timeout_seconds.filter(|v| *v != 0) {
            config.idle_timeout_secs = value;
        }
    }
    config.sources = file.sources;
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|v| v.parse::<T>().ok())
}

/// Accepts `#rgb` or `#rrggbb` and returns the long lowercase form.
pub(crate) fn normalize_color(raw: &str) -> Option<String> {
    let hex = raw.trim().strip_prefix('#')?;
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    match hex.len() {
        6 => Some(format!("#{}", hex.to_ascii_lowercase())),
        3 => {
            let long: String = hex
                .chars()
                .flat_map(|c| [c, c])
                .collect::<String>()
                .to_ascii_lowercase();
            Some(format!("#{long}"))
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn test_config(sources: Vec<SourceConfig>) -> Config {
    Config {
        application_name: "Thermometer".to_string(),
        database_url: "sqlite::memory:".to_string(),
        mqtt_host: "127.0.0.1".to_string(),
        mqtt_port: 1883,
        mqtt_username: None,
        mqtt_password: None,
        mqtt_keepalive_secs: 30,
        mqtt_client_id: "thermo-feed-test".to_string(),
        enable_mqtt_listener: false,
        http_bind: "127.0.0.1:0".to_string(),
        max_queue: 64,
        flush_check_interval_ms: 1000,
        sweep_interval_secs: 10,
        idle_timeout_secs: 300,
        cache_cleanup_interval_secs: 300,
        subscriber_send_timeout_ms: 200,
        otlp_endpoint: None,
        sources,
        config_file: ConfigFile::Missing(PathBuf::from(DEFAULT_CONFIG_PATH)),
    }
}
