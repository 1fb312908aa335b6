//! Per-device capability provisioning.
//!
//! [`DeviceProvisioner::provision`] turns a [`DeviceRequest`] into a
//! [`ProvisionedDevice`] holding every requested capability. Acquisition is
//! all-or-nothing: when one capability fails, those already acquired are
//! disabled again before the error is returned.

use std::fmt;

use tracing::{error, info, warn};

use crate::capability::{BluetoothCapability, CapabilityKind, ContainerHints, ResourceCapability, ThreadCapability};
use crate::config::DeviceConfig;
use crate::context::HostContext;
use crate::error::{Result, TeardownReport};
use crate::radio::RadioMode;

/// What a device asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    /// Device id.
    pub device_id: String,
    /// Capabilities, acquired in this order.
    pub capabilities: Vec<CapabilityKind>,
    /// Radio emulator mode for Thread.
    pub rcp_mode: bool,
}

impl DeviceRequest {
    /// Creates a request with no capabilities.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            capabilities: Vec::new(),
            rcp_mode: false,
        }
    }

    /// Adds a capability.
    pub fn with(mut self, kind: CapabilityKind) -> Self {
        self.capabilities.push(kind);
        self
    }

    /// Sets RCP mode.
    pub fn rcp_mode(mut self, rcp: bool) -> Self {
        self.rcp_mode = rcp;
        self
    }
}

impl TryFrom<&DeviceConfig> for DeviceRequest {
    type Error = crate::error::OrchestratorError;

    fn try_from(config: &DeviceConfig) -> Result<Self> {
        let capabilities = config
            .capabilities
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<CapabilityKind>>>()?;
        Ok(Self {
            device_id: config.id.clone(),
            capabilities,
            rcp_mode: config.rcp_mode,
        })
    }
}

/// Acquires capabilities for devices.
#[derive(Debug, Clone)]
pub struct DeviceProvisioner {
    ctx: HostContext,
}

impl DeviceProvisioner {
    /// Creates a provisioner over `ctx`.
    pub fn new(ctx: HostContext) -> Self {
        Self { ctx }
    }

    /// Returns the context.
    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    fn acquire(&self, request: &DeviceRequest, kind: CapabilityKind) -> Result<Box<dyn ResourceCapability>> {
        let capability: Box<dyn ResourceCapability> = match kind {
            CapabilityKind::Bluetooth => Box::new(BluetoothCapability::enable(&self.ctx)?),
            CapabilityKind::Thread => Box::new(ThreadCapability::enable(
                &self.ctx,
                &request.device_id,
                RadioMode::from_rcp_flag(request.rcp_mode),
            )?),
        };
        Ok(capability)
    }

    /// Acquires every capability of `request`, in order.
    pub fn provision(&self, request: &DeviceRequest) -> Result<ProvisionedDevice> {
        let mut acquired: Vec<Box<dyn ResourceCapability>> = Vec::with_capacity(request.capabilities.len());

        for &kind in &request.capabilities {
            match self.acquire(request, kind) {
                Ok(capability) => acquired.push(capability),
                Err(e) => {
                    error!(device = %request.device_id, capability = %kind, error = %e, "Capability acquisition failed");
                    let report = release_all(&mut acquired);
                    if !report.is_clean() {
                        warn!(device = %request.device_id, report = %report, "Rollback left issues");
                    }
                    return Err(e);
                }
            }
        }

        info!(device = %request.device_id, capabilities = acquired.len(), "Device provisioned");
        Ok(ProvisionedDevice {
            device_id: request.device_id.clone(),
            capabilities: acquired,
        })
    }
}

fn release_all(capabilities: &mut Vec<Box<dyn ResourceCapability>>) -> TeardownReport {
    let mut report = TeardownReport::new();
    while let Some(mut capability) = capabilities.pop() {
        report.merge(capability.disable());
    }
    report
}

/// A device holding its capabilities.
pub struct ProvisionedDevice {
    device_id: String,
    capabilities: Vec<Box<dyn ResourceCapability>>,
}

impl ProvisionedDevice {
    /// Returns the device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Names of the held capabilities, in acquisition order.
    pub fn capability_names(&self) -> Vec<&'static str> {
        self.capabilities.iter().map(|c| c.name()).collect()
    }

    /// Container launch hints of all capabilities, merged.
    pub fn hints(&self) -> ContainerHints {
        let mut hints = ContainerHints::new();
        for capability in &self.capabilities {
            hints.merge(capability.container_hints());
        }
        hints
    }

    /// Disables every capability in reverse acquisition order.
    ///
    /// A second call finds nothing left to release.
    pub fn release(&mut self) -> TeardownReport {
        if !self.capabilities.is_empty() {
            info!(device = %self.device_id, "Releasing device");
        }
        release_all(&mut self.capabilities)
    }

    /// Returns true once `release` ran.
    pub fn is_released(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl fmt::Debug for ProvisionedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionedDevice")
            .field("device_id", &self.device_id)
            .field("capabilities", &self.capability_names())
            .finish()
    }
}

impl Drop for ProvisionedDevice {
    fn drop(&mut self) {
        let report = self.release();
        if !report.is_clean() {
            warn!(device = %self.device_id, report = %report, "Device released on drop");
        }
    }
}
