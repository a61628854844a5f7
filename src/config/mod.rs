//! Runtime configuration
//!
//! Configuration is loaded from a JSON file, with `TUNERFORGE_*` environment
//! variables overriding scalar keys. There is no settings database: a config
//! file plus environment is enough for a headless service, and it keeps
//! provider credentials out of anything the process persists.
//!
//! One key is deliberately required with no default:
//! `startup_timeout_policy`. What to do when the startup gate times out
//! (keep streaming whatever arrives vs. fail the session) changes observable
//! client behavior, so the operator has to pick one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// What the gateway does when the startup gate times out
///
/// No `Default` impl on purpose: a config file that omits
/// `startup_timeout_policy` is rejected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateTimeoutPolicy {
    /// Emit the bootstrap TS (if enabled), then forward whatever arrives
    Stream,
    /// Fail the session
    Fail,
}

/// Transcode mode for HLS remux sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeMode {
    #[default]
    Off,
    On,
    Auto,
}

/// Internal stream buffer size: unbuffered, fixed, or "auto" (2 MiB)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBufferBytes {
    Unbuffered,
    Fixed(usize),
    Auto,
}

/// 2 MiB, roughly ten seconds of a typical IPTV feed
const AUTO_STREAM_BUFFER_BYTES: usize = 2 * 1024 * 1024;

impl StreamBufferBytes {
    /// Resolve to a concrete byte count
    pub fn resolve(self) -> usize {
        match self {
            StreamBufferBytes::Unbuffered => 0,
            StreamBufferBytes::Fixed(n) => n,
            StreamBufferBytes::Auto => AUTO_STREAM_BUFFER_BYTES,
        }
    }
}

impl Default for StreamBufferBytes {
    fn default() -> Self {
        StreamBufferBytes::Unbuffered
    }
}

impl Serialize for StreamBufferBytes {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            StreamBufferBytes::Unbuffered => s.serialize_u64(0),
            StreamBufferBytes::Fixed(n) => s.serialize_u64(*n as u64),
            StreamBufferBytes::Auto => s.serialize_str("auto"),
        }
    }
}

impl<'de> Deserialize<'de> for StreamBufferBytes {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Number(0) => Ok(StreamBufferBytes::Unbuffered),
            Raw::Number(n) => Ok(StreamBufferBytes::Fixed(n as usize)),
            Raw::Text(s) if s.eq_ignore_ascii_case("auto") => Ok(StreamBufferBytes::Auto),
            Raw::Text(s) => Err(serde::de::Error::custom(format!(
                "stream_buffer_bytes must be 0, a byte count, or \"auto\", got \"{}\"",
                s
            ))),
        }
    }
}

/// Smoketest filter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmoketestConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Per-URL pass/fail cache lifetime in seconds
    #[serde(default = "default_smoketest_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_smoketest_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_smoketest_concurrency")]
    pub concurrency: usize,
    /// Upper bound on how many channels are probed per run
    #[serde(default = "default_smoketest_max_channels")]
    pub max_channels: usize,
    /// Per-URL read budget once connected
    #[serde(default = "default_smoketest_max_duration_ms")]
    pub max_duration_ms: u64,
}

impl Default for SmoketestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_smoketest_ttl_secs(),
            timeout_ms: default_smoketest_timeout_ms(),
            concurrency: default_smoketest_concurrency(),
            max_channels: default_smoketest_max_channels(),
            max_duration_ms: default_smoketest_max_duration_ms(),
        }
    }
}

fn default_smoketest_ttl_secs() -> u64 {
    6 * 60 * 60
}
fn default_smoketest_timeout_ms() -> u64 {
    8_000
}
fn default_smoketest_concurrency() -> usize {
    4
}
fn default_smoketest_max_channels() -> usize {
    50
}
fn default_smoketest_max_duration_ms() -> u64 {
    4_000
}

/// Full runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Self URL advertised in discover.json; derived from the local IP when unset
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_tuner_count")]
    pub tuner_count: u32,
    #[serde(default = "default_lineup_max_channels")]
    pub lineup_max_channels: usize,

    /// Candidate provider base URLs, probed and ranked at fetch time
    #[serde(default)]
    pub provider_urls: Vec<String>,
    #[serde(default)]
    pub provider_user: String,
    #[serde(default)]
    pub provider_pass: String,
    #[serde(default)]
    pub playlist_url: Option<String>,
    /// Restrict the catalog to live channels even on the Xtream path
    #[serde(default)]
    pub live_only: bool,

    #[serde(default)]
    pub stream_transcode_mode: TranscodeMode,
    #[serde(default)]
    pub stream_buffer_bytes: StreamBufferBytes,

    #[serde(default = "default_startup_min_bytes")]
    pub startup_min_bytes: usize,
    #[serde(default = "default_startup_max_bytes")]
    pub startup_max_bytes: usize,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default)]
    pub require_good_start: bool,
    /// Required, no default: "stream" or "fail"
    pub startup_timeout_policy: GateTimeoutPolicy,

    #[serde(default = "default_true")]
    pub null_ts_keepalive: bool,
    #[serde(default = "default_keepalive_ms")]
    pub null_ts_keepalive_ms: u64,
    #[serde(default)]
    pub program_keepalive: bool,
    #[serde(default = "default_keepalive_ms")]
    pub program_keepalive_ms: u64,

    #[serde(default)]
    pub bootstrap_ts: bool,
    #[serde(default = "default_bootstrap_ts_seconds")]
    pub bootstrap_ts_seconds: u32,

    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub xmltv_url: Option<String>,
    #[serde(default = "default_xmltv_cache_ttl_secs")]
    pub xmltv_cache_ttl_secs: u64,
    /// Drop guide channels that end up with no programmes after remapping
    #[serde(default)]
    pub epg_prune_unlinked: bool,
    /// Keep only channels with a tvg-id correlation
    #[serde(default)]
    pub epg_linked_only: bool,

    #[serde(default)]
    pub smoketest: SmoketestConfig,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Directory holding catalog, fetch state, and TTL caches
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub retry_403: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_dead_read_timeout_ms")]
    pub dead_read_timeout_ms: u64,
    #[serde(default = "default_category_workers")]
    pub category_workers: usize,
}

fn default_listen_port() -> u16 {
    5004
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_tuner_count() -> u32 {
    2
}
fn default_lineup_max_channels() -> usize {
    480
}
fn default_startup_min_bytes() -> usize {
    64 * 1024
}
fn default_startup_max_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_startup_timeout_ms() -> u64 {
    15_000
}
fn default_true() -> bool {
    true
}
fn default_keepalive_ms() -> u64 {
    250
}
fn default_bootstrap_ts_seconds() -> u32 {
    1
}
fn default_refresh_interval_secs() -> u64 {
    12 * 60 * 60
}
fn default_xmltv_cache_ttl_secs() -> u64 {
    6 * 60 * 60
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_probe_timeout_ms() -> u64 {
    10_000
}
fn default_dead_read_timeout_ms() -> u64 {
    20_000
}
fn default_category_workers() -> usize {
    8
}

impl Config {
    /// Construct a config with defaults for everything except the gate
    /// timeout policy, which has to be chosen explicitly
    pub fn new(startup_timeout_policy: GateTimeoutPolicy) -> Self {
        // Round-trip through serde so the defaults live in one place
        let value = serde_json::json!({
            "startup_timeout_policy": startup_timeout_policy,
        });
        serde_json::from_value(value).expect("defaults must deserialize")
    }

    /// Load a config file, apply environment overrides, and validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Config = serde_json::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `TUNERFORGE_*` environment overrides for scalar keys
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TUNERFORGE_BASE_URL") {
            self.base_url = Some(v);
        }
        if let Ok(v) = std::env::var("TUNERFORGE_LISTEN_PORT") {
            if let Ok(port) = v.parse() {
                self.listen_port = port;
            }
        }
        if let Ok(v) = std::env::var("TUNERFORGE_TUNER_COUNT") {
            if let Ok(n) = v.parse() {
                self.tuner_count = n;
            }
        }
        if let Ok(v) = std::env::var("TUNERFORGE_PROVIDER_USER") {
            self.provider_user = v;
        }
        if let Ok(v) = std::env::var("TUNERFORGE_PROVIDER_PASS") {
            self.provider_pass = v;
        }
        if let Ok(v) = std::env::var("TUNERFORGE_PLAYLIST_URL") {
            self.playlist_url = Some(v);
        }
        if let Ok(v) = std::env::var("TUNERFORGE_XMLTV_URL") {
            self.xmltv_url = Some(v);
        }
        if let Ok(v) = std::env::var("TUNERFORGE_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tuner_count == 0 {
            return Err(ConfigError::Invalid("tuner_count must be at least 1".into()));
        }
        if self.startup_min_bytes > self.startup_max_bytes {
            return Err(ConfigError::Invalid(format!(
                "startup_min_bytes ({}) exceeds startup_max_bytes ({})",
                self.startup_min_bytes, self.startup_max_bytes
            )));
        }
        if self.provider_urls.is_empty() && self.playlist_url.is_none() {
            return Err(ConfigError::Invalid(
                "either provider_urls or playlist_url must be set".into(),
            ));
        }
        if self.category_workers == 0 {
            return Err(ConfigError::Invalid(
                "category_workers must be at least 1".into(),
            ));
        }
        for url in &self.provider_urls {
            crate::netutil::validate_url(url)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if let Some(url) = &self.playlist_url {
            crate::netutil::validate_url(url)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    /// Directory holding catalog, fetch state, and caches
    ///
    /// Falls back to the platform data dir, then the current directory.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("tunerforge"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Path of the persisted catalog
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir().join("catalog.json")
    }

    /// Path of the fetch-state checkpoint, kept beside the catalog
    pub fn fetch_state_path(&self) -> PathBuf {
        self.data_dir().join("catalog.json.fetchstate.json")
    }

    /// Path of the XMLTV TTL cache
    pub fn xmltv_cache_path(&self) -> PathBuf {
        self.data_dir().join("xmltv_cache.json")
    }

    /// Path of the smoketest TTL cache
    pub fn smoketest_cache_path(&self) -> PathBuf {
        self.data_dir().join("smoketest_cache.json")
    }
}
