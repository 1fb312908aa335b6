//! Orchestrator configuration.
//!
//! Loaded from TOML; every section has defaults so an empty file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HomebedConfig {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Bluetooth daemons and adapter pool.
    pub bluetooth: BluetoothConfig,

    /// Home network provisioning.
    pub network: NetworkConfig,

    /// Virtual radio links.
    pub radio: RadioConfig,

    /// The home provisioned by the agent binary.
    pub home: HomeConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (pretty, json, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Bluetooth capability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Root of the BlueZ build providing the daemons and tools.
    pub bluez_dir: PathBuf,

    /// Low-energy daemon, relative to `bluez_dir`.
    pub bluetoothd: PathBuf,

    /// Virtual adapter daemon, relative to `bluez_dir`.
    pub btvirt: PathBuf,

    /// Adapter listing tool, relative to `bluez_dir`.
    pub hciconfig: PathBuf,

    /// Number of virtual adapters the adapter daemon creates.
    pub virtual_adapters: u32,

    /// Pause after killing stale daemons before relaunching.
    pub settle_delay_ms: u64,

    /// Pause after launching a daemon before the first probe.
    pub startup_grace_ms: u64,

    /// Number of readiness probes before giving up.
    pub probe_retries: u32,

    /// Pause between readiness probes.
    pub probe_interval_ms: u64,

    /// D-Bus socket directory shared with Bluetooth devices.
    pub dbus_socket_dir: PathBuf,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            bluez_dir: PathBuf::from("/opt/homebed/bluez"),
            bluetoothd: PathBuf::from("src/bluetoothd"),
            btvirt: PathBuf::from("emulator/btvirt"),
            hciconfig: PathBuf::from("tools/hciconfig"),
            virtual_adapters: 2,
            settle_delay_ms: 3000,
            startup_grace_ms: 2000,
            probe_retries: 3,
            probe_interval_ms: 1000,
            dbus_socket_dir: PathBuf::from("/var/run/dbus"),
        }
    }
}

impl BluetoothConfig {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.bluez_dir.join(path)
        }
    }

    /// Absolute path of the low-energy daemon.
    pub fn bluetoothd_path(&self) -> PathBuf {
        self.resolve(&self.bluetoothd)
    }

    /// Absolute path of the virtual adapter daemon.
    pub fn btvirt_path(&self) -> PathBuf {
        self.resolve(&self.btvirt)
    }

    /// Absolute path of the adapter listing tool.
    pub fn hciconfig_path(&self) -> PathBuf {
        self.resolve(&self.hciconfig)
    }

    /// Returns the settle delay as a Duration.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Returns the startup grace as a Duration.
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Returns the probe interval as a Duration.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Home network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Docker CLI binary.
    pub docker: String,

    /// `ip` binary used for route and address introspection.
    pub ip: String,

    /// iptables binary.
    pub iptables: String,

    /// Chain the isolation rules are inserted into.
    pub firewall_chain: String,

    /// Network names containing this marker are bound to the host's default
    /// interface instead of getting an engine-assigned subnet.
    pub parent_interface_marker: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            ip: "ip".to_string(),
            iptables: "iptables".to_string(),
            firewall_chain: "DOCKER-USER".to_string(),
            parent_interface_marker: "ipvlan".to_string(),
        }
    }
}

/// Virtual radio link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Radio emulator for RCP mode.
    pub rcp_binary: String,

    /// Radio emulator for NCP/FTD mode.
    pub ncp_binary: String,

    /// Ports reserved per link; link N uses offset `N * port_group_size`.
    pub port_group_size: u64,

    /// Parent of the per-link working directories.
    pub work_dir: PathBuf,

    /// socat binary used for pipe pairs.
    pub socat: String,

    /// How long to wait for socat to create both pipe endpoints.
    pub pipe_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL for radio processes.
    pub stop_grace_ms: u64,

    /// Directories prepended to `PATH` when launching radio binaries.
    pub extra_path: Vec<PathBuf>,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            rcp_binary: "ot-rcp".to_string(),
            ncp_binary: "ot-ncp-ftd".to_string(),
            port_group_size: 34,
            work_dir: PathBuf::from("./tmp"),
            socat: "socat".to_string(),
            pipe_timeout_ms: 5000,
            stop_grace_ms: 5000,
            extra_path: Vec::new(),
        }
    }
}

impl RadioConfig {
    /// Returns the pipe timeout as a Duration.
    pub fn pipe_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_timeout_ms)
    }

    /// Returns the stop grace as a Duration.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Home provisioned by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeConfig {
    /// Network name of the home.
    pub name: String,

    /// Whether the home network has no external gateway access.
    pub internal: bool,

    /// Devices to provision.
    pub devices: Vec<DeviceConfig>,
}

impl Default for HomeConfig {
    fn default() -> Self {
        Self {
            name: "home0".to_string(),
            internal: false,
            devices: Vec::new(),
        }
    }
}

/// One device of the home.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device id, passed to radio emulators.
    pub id: String,

    /// Capability names, e.g. `["Bluetooth", "Thread"]`.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Run the radio emulator in RCP mode.
    #[serde(default)]
    pub rcp_mode: bool,
}

impl HomebedConfig {
    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(OrchestratorError::configuration(format!(
                "invalid log level: {}",
                self.logging.level
            )));
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(OrchestratorError::configuration(format!(
                "invalid log format: {}",
                self.logging.format
            )));
        }

        if self.bluetooth.virtual_adapters == 0 {
            return Err(OrchestratorError::configuration(
                "bluetooth.virtual_adapters must be at least 1",
            ));
        }

        if self.radio.port_group_size == 0 {
            return Err(OrchestratorError::configuration(
                "radio.port_group_size must be at least 1",
            ));
        }

        if self.home.name.is_empty() {
            return Err(OrchestratorError::configuration("home.name must not be empty"));
        }

        Ok(())
    }
}
