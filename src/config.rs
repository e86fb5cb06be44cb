//! Agent configuration
//!
//! Read from a TOML file (first CLI argument, or `NIC_AGENT_CONFIG`); every
//! field has a default so a missing file is not an error. A handful of
//! `NIC_AGENT_*` environment variables override the file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::command::{DispatcherConfig, ReporterConfig};
use crate::connection::ConnectionConfig;
use crate::hardware::BackendKind;

pub const CONFIG_PATH_ENV: &str = "NIC_AGENT_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identifier sent in every message header
    pub device_id: String,
    /// `host:port` of the control plane
    pub control_plane: String,
    pub backend: BackendKind,
    /// Hard limit for a single vendor tool invocation
    #[serde(with = "duration_ms", rename = "tool_timeout_ms")]
    pub tool_timeout: Duration,
    pub dispatcher: DispatcherConfig,
    pub reporter: ReporterConfig,
    pub connection: ConnectionConfig,
    pub bmc: BmcConfig,
    pub disk: DiskConfig,
    pub storage: StorageConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: "nic-agent".to_string(),
            control_plane: "127.0.0.1:7600".to_string(),
            backend: BackendKind::default(),
            tool_timeout: Duration::from_secs(300),
            dispatcher: DispatcherConfig::default(),
            reporter: ReporterConfig::default(),
            connection: ConnectionConfig::default(),
            bmc: BmcConfig::default(),
            disk: DiskConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Baseboard management controller access
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BmcConfig {
    pub tool: String,
    /// ipmitool interface used for a remote BMC
    pub interface: String,
    /// Remote BMC address; unset talks to the local BMC
    pub host: Option<String>,
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            tool: "ipmitool".to_string(),
            interface: "lanplus".to_string(),
            host: None,
            user: None,
            password: None,
        }
    }
}

impl fmt::Debug for BmcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BmcConfig")
            .field("tool", &self.tool)
            .field("interface", &self.interface)
            .field("host", &self.host)
            .field("user", &self.user)
            .field(
                "password",
                if self.password.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Image writer (qemu-img compatible)
    pub writer: String,
    /// Host disk the image is written to
    pub device: String,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            writer: "qemu-img".to_string(),
            device: "/dev/sda".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage daemon RPC client (iSCSI bdevs)
    pub stor_rpc: String,
    /// Emulator RPC client (virtio-blk devices)
    pub emulator_rpc: String,
    /// Where the set of created devices is persisted
    pub state_file: PathBuf,
    #[serde(with = "duration_ms", rename = "settle_delay_ms")]
    pub settle_delay: Duration,
    pub cpumask: String,
    pub num_queues: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            stor_rpc: "nbl_stor_rpc.py".to_string(),
            emulator_rpc: "nbl_rpc.py".to_string(),
            state_file: PathBuf::from("/var/lib/nic-agent/devices.json"),
            settle_delay: Duration::from_secs(10),
            cpumask: "0x2".to_string(),
            num_queues: 1,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("device_id must not be empty".into()));
        }
        if self.dispatcher.workers == 0 {
            return Err(ConfigError::Invalid("dispatcher.workers must be at least 1".into()));
        }
        if self.dispatcher.default_deadline.is_zero() {
            return Err(ConfigError::Invalid("dispatcher.default_deadline_ms must be positive".into()));
        }
        if self.reporter.max_attempts == 0 {
            return Err(ConfigError::Invalid("reporter.max_attempts must be at least 1".into()));
        }
        if self.tool_timeout.is_zero() {
            return Err(ConfigError::Invalid("tool_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    /// Apply `NIC_AGENT_*` overrides. `lookup` is `std::env::var` in
    /// production.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `NIC_AGENT_DEVICE_ID` | `device_id` |
    /// | `NIC_AGENT_CONTROL_PLANE` | `control_plane` |
    /// | `NIC_AGENT_BACKEND` | `backend` |
    /// | `NIC_AGENT_WORKERS` | `dispatcher.workers` |
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("NIC_AGENT_DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = lookup("NIC_AGENT_CONTROL_PLANE") {
            self.control_plane = v;
        }
        if let Some(v) = lookup("NIC_AGENT_BACKEND") {
            self.backend = v.parse().map_err(ConfigError::Invalid)?;
        }
        if let Some(v) = lookup("NIC_AGENT_WORKERS") {
            self.dispatcher.workers = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("NIC_AGENT_WORKERS=`{v}` is not a number")))?;
        }
        Ok(())
    }
}

/// Config file path: the first CLI argument, else `NIC_AGENT_CONFIG`
pub fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
}

/// Load, override from the environment and validate
pub fn load(path: Option<&Path>) -> Result<AgentConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_file(path)?,
        None => AgentConfig::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Parse one TOML file. A file that does not exist yields the defaults.
pub fn load_file(path: &Path) -> Result<AgentConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AgentConfig::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
