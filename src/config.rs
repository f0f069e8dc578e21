//! Session configuration
//!
//! Loaded from an optional TOML file and overridden by command line flags.
//! The same structure is sent to the web interface as the `config` message.

use crate::constants::{limits, serial, timing};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Number of data frames to read before the cycle ends.
///
/// `inf` is stored as `u64::MAX`, which is never reached in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LoopSetting", into = "LoopSetting")]
pub struct LoopCount(u64);

impl LoopCount {
    pub const INFINITE: LoopCount = LoopCount(limits::INFINITE_LOOPS);

    pub fn new(count: u64) -> Self {
        Self(count)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_infinite(self) -> bool {
        self.0 == limits::INFINITE_LOOPS
    }
}

impl Default for LoopCount {
    fn default() -> Self {
        Self::INFINITE
    }
}

impl fmt::Display for LoopCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for LoopCount {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("inf") {
            return Ok(Self::INFINITE);
        }
        s.parse::<u64>()
            .map(LoopCount)
            .map_err(|_| ConfigError::InvalidLoopCount(s.to_string()))
    }
}

/// Loop count as written in TOML / JSON: a number or "inf"
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum LoopSetting {
    Count(u64),
    Text(String),
}

impl TryFrom<LoopSetting> for LoopCount {
    type Error = ConfigError;

    fn try_from(setting: LoopSetting) -> Result<Self, Self::Error> {
        match setting {
            LoopSetting::Count(n) => Ok(LoopCount(n)),
            LoopSetting::Text(s) => s.parse(),
        }
    }
}

impl From<LoopCount> for LoopSetting {
    fn from(count: LoopCount) -> Self {
        if count.is_infinite() {
            LoopSetting::Text("inf".to_string())
        } else {
            LoopSetting::Count(count.0)
        }
    }
}

/// Where the data logger writes captured frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Output {
    #[default]
    Stdout,
    File,
}

impl FromStr for Output {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdout" => Ok(Output::Stdout),
            "file" => Ok(Output::File),
            other => Err(ConfigError::InvalidOutput(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial port name/path, or `emulator`
    pub port: String,
    /// Ports found on this machine, filled in at startup
    #[serde(skip_deserializing)]
    pub ports: Vec<String>,
    #[serde(rename = "loop")]
    pub loop_count: LoopCount,
    pub output: Output,
    /// Hand captured frames to the data logger
    pub logging: bool,
    pub log_folder: PathBuf,
    pub data_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub response_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub liveness_timeout_ms: u64,
    pub ws_port: u16,
    /// Connect to the ECU as soon as the process starts
    pub connect_on_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: String::new(),
            ports: Vec::new(),
            loop_count: LoopCount::INFINITE,
            output: Output::Stdout,
            logging: false,
            log_folder: default_log_folder(),
            data_interval_ms: timing::DATA_INTERVAL_MS,
            heartbeat_interval_ms: timing::HEARTBEAT_INTERVAL_MS,
            response_timeout_ms: timing::RESPONSE_TIMEOUT_MS,
            handshake_timeout_ms: timing::HANDSHAKE_TIMEOUT_MS,
            liveness_timeout_ms: timing::LIVENESS_TIMEOUT_MS,
            ws_port: limits::WS_PORT,
            connect_on_start: false,
        }
    }
}

/// `~/memsfcr/logs`, or `./logs` when there is no home folder
pub fn default_log_folder() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join("memsfcr").join("logs"),
        None => PathBuf::from("logs"),
    }
}

/// `~/memsfcr/memsfcr.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join("memsfcr").join("memsfcr.toml"))
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                debug!("No config file at {}, using defaults", p.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn is_emulated(&self) -> bool {
        self.port.eq_ignore_ascii_case(serial::EMULATOR_PORT)
    }

    pub fn data_interval(&self) -> Duration {
        Duration::from_millis(self.data_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}
