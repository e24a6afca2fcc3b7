//! # Configuration Management
//!
//! Centralized configuration for the AP, its components and the bus between them.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides (`TRUSTBUS_*`)
//!
//! Secrets are not part of this file. They live in separate TOML documents
//! referenced by path, see [`crate::utils::keystore`].

use crate::error::{ProtocolError, Result};
use crate::transport::BusAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Default wait for one bus exchange
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default wait for a LIST probe; most scanned addresses are empty
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(50);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TrustConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub ap: ApConfig,

    #[serde(default)]
    pub component: ComponentConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TrustConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ProtocolError::ConfigError(format!("Bad config TOML: {e}")))
    }

    /// Defaults overridden by `TRUSTBUS_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Overwrite fields from any `TRUSTBUS_*` variables that are set.
    ///
    /// A variable that is set but unparsable is an error, not ignored.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("TRUSTBUS_BRIDGE_ADDRESS") {
            self.bus.bridge_address = addr;
        }

        if let Ok(ms) = std::env::var("TRUSTBUS_EXCHANGE_TIMEOUT_MS") {
            let ms = ms.trim().parse::<u64>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid TRUSTBUS_EXCHANGE_TIMEOUT_MS: {ms}"))
            })?;
            self.bus.exchange_timeout = Duration::from_millis(ms);
        }

        if let Ok(ids) = std::env::var("TRUSTBUS_COMPONENT_IDS") {
            self.ap.component_ids = ids
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(parse_component_id)
                .collect::<Result<_>>()?;
        }

        if let Ok(id) = std::env::var("TRUSTBUS_COMPONENT_ID") {
            self.component.component_id = parse_component_id(&id)?;
        }

        if let Ok(level) = std::env::var("TRUSTBUS_LOG_LEVEL") {
            self.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(())
    }

    /// Defaults adjusted by `mutator`; handy in tests.
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The defaults rendered as TOML, for writing a starter file.
    pub fn example_config() -> Result<String> {
        Self::default().to_toml()
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Cannot render config: {e}")))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Every problem found, one message each. Empty means usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.bus.validate());
        errors.extend(self.ap.validate());
        errors.extend(self.component.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// [`validate`](Self::validate), folded into one error.
    pub fn validate_strict(&self) -> Result<()> {
        match self.validate().as_slice() {
            [] => Ok(()),
            problems => Err(ProtocolError::ConfigError(format!(
                "Invalid configuration: {}",
                problems.join("; ")
            ))),
        }
    }
}

/// Parse a component id written in hex, with or without `0x`.
pub fn parse_component_id(text: &str) -> Result<u32> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16)
        .map_err(|_| ProtocolError::ConfigError(format!("Invalid component id: '{trimmed}'")))
}

/// Why `id` could never be reached by a scan, if it can't.
fn unreachable_reason(id: u32) -> Option<String> {
    let addr = BusAddress::from_component_id(id);
    if addr.is_reserved() {
        Some(format!(
            "Component id {id:#010x} maps to reserved bus address {addr}"
        ))
    } else if !BusAddress::scan_range().any(|a| a == addr) {
        Some(format!(
            "Component id {id:#010x} maps to bus address {addr} outside the scan range"
        ))
    } else {
        None
    }
}

/// Bus and bridge settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// TCP bus bridge address (e.g., "127.0.0.1:7400")
    pub bridge_address: String,

    /// Timeout for one request/response exchange
    #[serde(with = "millis")]
    pub exchange_timeout: Duration,

    /// Timeout for each LIST probe during a scan
    #[serde(with = "millis")]
    pub scan_timeout: Duration,

    /// Extra attempts for an exchange that failed on the transport
    pub retry_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bridge_address: String::from("127.0.0.1:7400"),
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            retry_attempts: 2,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bridge_address.is_empty() {
            errors.push("Bridge address cannot be empty".to_string());
        } else if self.bridge_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid bridge address format: '{}' (expected format: '127.0.0.1:7400')",
                self.bridge_address
            ));
        }

        if self.exchange_timeout.as_millis() < 10 {
            errors.push("Exchange timeout too short (minimum: 10ms)".to_string());
        } else if self.exchange_timeout.as_secs() > 60 {
            errors.push("Exchange timeout too long (maximum: 60s)".to_string());
        }

        if self.scan_timeout.is_zero() {
            errors.push("Scan timeout cannot be 0".to_string());
        } else if self.scan_timeout > self.exchange_timeout {
            errors.push("Scan timeout cannot exceed the exchange timeout".to_string());
        }

        if self.retry_attempts > 10 {
            errors.push(format!(
                "Retry attempts too high: {} (maximum: 10)",
                self.retry_attempts
            ));
        }

        errors
    }
}

/// Application processor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApConfig {
    /// Path to the AP secrets TOML
    pub secrets_path: String,

    /// Provisioning record file; kept in memory when absent
    pub flash_path: Option<String>,

    /// Components written to the provisioning record on first boot
    pub component_ids: Vec<u32>,
}

impl Default for ApConfig {
    fn default() -> Self {
        Self {
            secrets_path: String::from("ap_secrets.toml"),
            flash_path: None,
            component_ids: Vec::new(),
        }
    }
}

impl ApConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.secrets_path.is_empty() {
            errors.push("AP secrets path cannot be empty".to_string());
        }

        if let Some(path) = &self.flash_path {
            errors.extend(missing_parent("Flash", Path::new(path)));
        }

        let mut seen = HashSet::new();
        let mut addresses = HashSet::new();
        for &id in &self.component_ids {
            if !seen.insert(id) {
                errors.push(format!("Duplicate component id {id:#010x}"));
                continue;
            }
            if !addresses.insert(BusAddress::from_component_id(id)) {
                errors.push(format!(
                    "Component id {id:#010x} shares a bus address with another component"
                ));
            }
            errors.extend(unreachable_reason(id));
        }

        errors
    }
}

/// Component settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ComponentConfig {
    pub component_id: u32,

    /// Path to the component secrets TOML
    pub secrets_path: String,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            component_id: 0x1111_1124,
            secrets_path: String::from("component_secrets.toml"),
        }
    }
}

impl ComponentConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.secrets_path.is_empty() {
            errors.push("Component secrets path cannot be empty".to_string());
        }
        errors.extend(unreachable_reason(self.component_id));
        errors
    }
}

/// Where tracing output goes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Name attached to the startup log line
    pub app_name: String,

    /// Default level; `RUST_LOG` overrides it
    #[serde(with = "level_name")]
    pub log_level: Level,

    /// Write to stderr
    pub log_to_console: bool,

    /// Append to `log_file_path`
    pub log_to_file: bool,
    pub log_file_path: Option<PathBuf>,

    /// One JSON object per event instead of human-readable lines
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("trustbus"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.trim().is_empty() {
            errors.push("Logging app_name is empty".to_string());
        }

        match (&self.log_file_path, self.log_to_file) {
            (None, true) => errors.push("log_to_file is set but log_file_path is missing".to_string()),
            (Some(path), true) => errors.extend(missing_parent("Log file", path)),
            _ => {}
        }

        if !self.log_to_console && !self.log_to_file {
            errors.push("Logging has no output: enable log_to_console or log_to_file".to_string());
        }

        errors
    }
}

/// Complaint if `path` sits in a directory that does not exist.
fn missing_parent(what: &str, path: &Path) -> Option<String> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty())?;
    (!parent.exists()).then(|| format!("{what} directory does not exist: {}", parent.display()))
}

/// Durations as whole milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `tracing::Level` as a lowercase name
mod level_name {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Level, D::Error> {
        let name = String::deserialize(d)?;
        name.parse()
            .map_err(|_| de::Error::custom(format!("unknown log level '{name}'")))
    }
}
