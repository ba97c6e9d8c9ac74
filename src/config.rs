//! Runner configuration: loaded from `config/algorunner.toml` and environment
//!
//! Load order: TOML file first, then `ALGORUNNER__*` environment variables
//! override it (double underscore separates nesting levels, e.g.
//! `ALGORUNNER__SOCKET__PORT=3001`). Every field has a default, so an empty
//! environment gives a working configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Storage protocol negotiated with the worker
///
/// `v1` returns results inline in `done`; `v2` and `v3` write them to
/// storage and report their placement in `storing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    V1,
    V2,
    #[default]
    V3,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::V1 => "v1",
            StorageMode::V2 => "v2",
            StorageMode::V3 => "v3",
        }
    }

    pub fn is_indirect(&self) -> bool {
        !matches!(self, StorageMode::V1)
    }
}

/// Configuration root
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RunnerConfig {
    pub socket: SocketConfig,
    pub storage_mode: StorageMode,
    pub algorithm: AlgorithmSection,
    pub discovery: DiscoveryConfig,
    pub storage: StorageSection,
    pub stop: StopSection,
}

impl RunnerConfig {
    /// Debug connections (explicit socket url) always run inline
    pub fn effective_storage_mode(&self) -> StorageMode {
        if self.socket.url.is_some() {
            StorageMode::V1
        } else {
            self.storage_mode
        }
    }

    /// Configuration for `debug()`: explicit url, inline results, no peer cache
    pub fn for_debug(mut self, url: impl Into<String>) -> Self {
        self.socket.url = Some(url.into());
        self.storage_mode = StorageMode::V1;
        self.discovery.enable = false;
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DebugTargetError {
    #[error("unable to connect, set either a debug url or hkube url and algorithm name")]
    Missing,

    #[error("invalid hkube url {0}")]
    InvalidUrl(String),
}

/// Where `debug()` connects
///
/// An explicit `url` wins; otherwise `hkube_url` and `algorithm_name`
/// together select the cluster's debug endpoint for that algorithm.
#[derive(Debug, Clone, Default)]
pub struct DebugOptions {
    pub url: Option<String>,
    pub hkube_url: Option<String>,
    pub algorithm_name: Option<String>,
}

impl DebugOptions {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn cluster(hkube_url: impl Into<String>, algorithm_name: impl Into<String>) -> Self {
        Self {
            hkube_url: Some(hkube_url.into()),
            algorithm_name: Some(algorithm_name.into()),
            ..Default::default()
        }
    }

    /// Resolve the worker socket url; the cluster form is
    /// `ws://<authority>/hkube/debug/<algorithm>`
    pub fn worker_url(&self) -> Result<String, DebugTargetError> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return Ok(url.to_string());
        }
        let (Some(hkube_url), Some(name)) = (
            self.hkube_url.as_deref().filter(|u| !u.is_empty()),
            self.algorithm_name.as_deref().filter(|n| !n.is_empty()),
        ) else {
            return Err(DebugTargetError::Missing);
        };
        let (_, rest) = hkube_url
            .split_once("://")
            .ok_or_else(|| DebugTargetError::InvalidUrl(hkube_url.to_string()))?;
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if authority.is_empty() {
            return Err(DebugTargetError::InvalidUrl(hkube_url.to_string()));
        }
        Ok(format!("ws://{}/hkube/debug/{}", authority, name))
    }
}

/// [socket]: worker connection
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_socket_host")]
    pub host: String,
    #[serde(default = "default_socket_port")]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Overrides protocol/host/port when set
    pub url: Option<String>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    pub max_payload: Option<usize>,
}

fn default_socket_host() -> String {
    "localhost".to_string()
}

fn default_socket_port() -> u16 {
    3000
}

fn default_protocol() -> String {
    "ws".to_string()
}

fn default_encoding() -> String {
    "json".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    100
}

impl SocketConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: default_socket_host(),
            port: default_socket_port(),
            protocol: default_protocol(),
            url: None,
            encoding: default_encoding(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_payload: None,
        }
    }
}

/// [algorithm]: which registered algorithm to bind
#[derive(Debug, Clone, Deserialize)]
pub struct AlgorithmSection {
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
}

fn default_entry_point() -> String {
    "main".to_string()
}

impl Default for AlgorithmSection {
    fn default() -> Self {
        Self {
            entry_point: default_entry_point(),
        }
    }
}

/// [discovery]: peer cache address and peer fetch timeout
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_host")]
    pub host: String,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_serving_report_interval_ms")]
    pub serving_report_interval_ms: u64,
}

fn default_discovery_host() -> String {
    "127.0.0.1".to_string()
}

fn default_discovery_port() -> u16 {
    9020
}

fn default_true() -> bool {
    true
}

fn default_discovery_timeout_ms() -> u64 {
    15_000
}

fn default_serving_report_interval_ms() -> u64 {
    5_000
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn serving_report_interval(&self) -> Duration {
        Duration::from_millis(self.serving_report_interval_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            host: default_discovery_host(),
            port: default_discovery_port(),
            enable: default_true(),
            timeout_ms: default_discovery_timeout_ms(),
            serving_report_interval_ms: default_serving_report_interval_ms(),
        }
    }
}

/// [storage]: filesystem backend and input read cache
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_base_directory")]
    pub base_directory: PathBuf,
    #[serde(default)]
    pub enable_cache: bool,
}

fn default_base_directory() -> PathBuf {
    PathBuf::from("/var/tmp/fs/storage")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
            enable_cache: false,
        }
    }
}

/// [stop]: draining stop heartbeat
#[derive(Debug, Clone, Deserialize)]
pub struct StopSection {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

impl StopSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for StopSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

/// Load configuration, `ALGORUNNER__*` environment variables win
///
/// 1. `config/algorunner.toml` (or `algorunner.toml`) when present
/// 2. `config_path` when given and present
/// 3. environment variables
pub fn load_config(config_path: Option<PathBuf>) -> Result<RunnerConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/algorunner", "algorunner"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ALGORUNNER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
