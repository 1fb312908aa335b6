//! Optional host features a simulated device may request.
//!
//! A capability acquires everything it needs when it is constructed and
//! gives it back in [`ResourceCapability::disable`]. While enabled it
//! describes what the device's container needs as [`ContainerHints`].

mod bluetooth;
mod thread;

pub use bluetooth::{
    natural_sort, parse_virtual_adapters, AdapterPool, BluetoothCapability, DaemonSpec, BLE_ADAPTER_ENV,
};
pub use thread::{ThreadCapability, THREAD_DEVICE_PATH, THREAD_PORT_OFFSET_ENV};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, TeardownReport};

/// Launch parameters a capability contributes to a device container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHints {
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
    /// Bind mounts as `host:container`.
    pub volumes: Vec<String>,
    /// Device mappings as `host:container`.
    pub devices: Vec<String>,
    /// Network mode override, e.g. `host`.
    pub network_mode: Option<String>,
}

impl ContainerHints {
    /// Creates empty hints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Adds a bind mount.
    pub fn volume(mut self, mount: impl Into<String>) -> Self {
        self.volumes.push(mount.into());
        self
    }

    /// Adds a device mapping.
    pub fn device(mut self, mapping: impl Into<String>) -> Self {
        self.devices.push(mapping.into());
        self
    }

    /// Sets the network mode.
    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Folds `other` into `self`. Later values win for environment keys and
    /// network mode; mounts and devices are deduplicated.
    pub fn merge(&mut self, other: ContainerHints) {
        self.environment.extend(other.environment);
        for volume in other.volumes {
            if !self.volumes.contains(&volume) {
                self.volumes.push(volume);
            }
        }
        for device in other.devices {
            if !self.devices.contains(&device) {
                self.devices.push(device);
            }
        }
        if other.network_mode.is_some() {
            self.network_mode = other.network_mode;
        }
    }

    /// Returns true if nothing is requested.
    pub fn is_empty(&self) -> bool {
        self.environment.is_empty()
            && self.volumes.is_empty()
            && self.devices.is_empty()
            && self.network_mode.is_none()
    }
}

/// A host feature held on behalf of one device.
pub trait ResourceCapability: Send + fmt::Debug {
    /// Capability name as used in device configuration.
    fn name(&self) -> &'static str;

    /// What the device container needs while this capability is enabled.
    fn container_hints(&self) -> ContainerHints;

    /// Releases everything acquired. Never fails; problems are reported.
    ///
    /// Calling `disable` more than once is a no-op.
    fn disable(&mut self) -> TeardownReport;
}

/// The capabilities a device can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityKind {
    /// A leased virtual BLE adapter.
    Bluetooth,
    /// A virtual Thread radio link.
    Thread,
}

impl CapabilityKind {
    /// Returns the configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            CapabilityKind::Bluetooth => "Bluetooth",
            CapabilityKind::Thread => "Thread",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CapabilityKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bluetooth" | "ble" => Ok(CapabilityKind::Bluetooth),
            "thread" => Ok(CapabilityKind::Thread),
            other => Err(OrchestratorError::configuration(format!("unknown capability: {other}"))),
        }
    }
}
