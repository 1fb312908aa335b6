//! One provisioned home: its network and its devices.

use anyhow::{Context, Result};
use homebed_orchestrator::config::HomeConfig;
use homebed_orchestrator::{
    ContainerHints, DeviceProvisioner, DeviceRequest, HostContext, NetworkState, ProvisionedDevice,
    TeardownReport, VirtualNetwork,
};
use serde::Serialize;
use tracing::{error, info};

/// What the container launcher needs to start the home's devices.
#[derive(Debug, Serialize)]
pub struct HomeManifest {
    pub network: String,
    pub state: String,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub devices: Vec<DeviceManifest>,
}

#[derive(Debug, Serialize)]
pub struct DeviceManifest {
    pub id: String,
    pub capabilities: Vec<&'static str>,
    pub hints: ContainerHints,
}

pub struct Home {
    network: VirtualNetwork,
    devices: Vec<ProvisionedDevice>,
}

impl Home {
    /// Creates the network, then provisions every device in order.
    ///
    /// If a device fails, everything provisioned so far is released again.
    pub fn up(ctx: &HostContext, config: &HomeConfig) -> Result<Self> {
        let network = VirtualNetwork::create(ctx, config.name.clone(), config.internal);
        let mut home = Self {
            network,
            devices: Vec::with_capacity(config.devices.len()),
        };

        let provisioner = DeviceProvisioner::new(ctx.clone());
        for device in &config.devices {
            let provisioned = DeviceRequest::try_from(device)
                .and_then(|request| provisioner.provision(&request))
                .with_context(|| format!("Failed to provision device {}", device.id));
            match provisioned {
                Ok(provisioned) => home.devices.push(provisioned),
                Err(e) => {
                    error!(device = %device.id, error = %e, "Tearing home down after failure");
                    let report = home.down();
                    if !report.is_clean() {
                        error!(report = %report, "Teardown after failure left issues");
                    }
                    return Err(e);
                }
            }
        }

        info!(home = %config.name, devices = home.devices.len(), state = %home.network.state(), "Home up");
        Ok(home)
    }

    pub fn network_state(&self) -> &NetworkState {
        self.network.state()
    }

    pub fn manifest(&self) -> HomeManifest {
        HomeManifest {
            network: self.network.name().to_string(),
            state: self.network.state().to_string(),
            subnet: self.network.subnet().map(str::to_string),
            gateway: self.network.gateway().map(str::to_string),
            devices: self
                .devices
                .iter()
                .map(|d| DeviceManifest {
                    id: d.device_id().to_string(),
                    capabilities: d.capability_names(),
                    hints: d.hints(),
                })
                .collect(),
        }
    }

    /// Releases devices in reverse order, then closes the network.
    pub fn down(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        while let Some(mut device) = self.devices.pop() {
            report.merge(device.release());
        }
        report.merge(self.network.close());
        report
    }
}
