//! Host resource orchestration for simulated IoT home test-beds.
//!
//! This crate provisions the host-level plumbing that simulated devices need:
//! virtual BLE adapters, isolated home networks and virtual Thread radios.
//! Everything it sets up is torn down again, also on error paths.
//!
//! # Overview
//!
//! - **Serial execution**: host mutations (daemon and emulator launches) run
//!   one at a time on a dedicated worker thread
//! - **Bluetooth**: shared daemons plus an adapter pool leasing one virtual
//!   adapter per device; the last device out stops the daemons
//! - **Home networks**: a docker network per home, with firewall rules
//!   blocking device-to-device traffic while allowing the gateway
//! - **Radio links**: pipe pairs wired to radio emulators on collision-free
//!   port ranges
//! - **Provisioning**: all-or-nothing capability acquisition per device
//!
//! # Architecture
//!
//! - [`executor`]: single-worker FIFO task executor
//! - [`host`]: host command runner and process handles
//! - [`firewall`]: isolation rules and the iptables backend
//! - [`network`]: home network segments
//! - [`radio`]: radio links, pipe pairs and the petition counter
//! - [`capability`]: Bluetooth and Thread capabilities
//! - [`provision`]: device provisioning
//! - [`context`]: shared pools and collaborators
//! - [`config`]: TOML configuration
//! - [`error`]: error types and teardown reports
//!
//! # Example
//!
//! ```ignore
//! use homebed_orchestrator::{
//!     CapabilityKind, DeviceProvisioner, DeviceRequest, HomebedConfig, HostContext, VirtualNetwork,
//! };
//!
//! let config = HomebedConfig::from_file("homebed.toml".as_ref())?;
//! let ctx = HostContext::builder().config(config).build();
//!
//! let mut home = VirtualNetwork::create(&ctx, "home0", false);
//! let provisioner = DeviceProvisioner::new(ctx.clone());
//! let mut lock = provisioner.provision(
//!     &DeviceRequest::new("lock")
//!         .with(CapabilityKind::Bluetooth)
//!         .with(CapabilityKind::Thread),
//! )?;
//! println!("{:?}", lock.hints());
//!
//! let _ = lock.release();
//! let _ = home.close();
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod firewall;
pub mod host;
pub mod network;
pub mod provision;
pub mod radio;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at the crate root
pub use capability::{
    AdapterPool, BluetoothCapability, CapabilityKind, ContainerHints, ResourceCapability, ThreadCapability,
};
pub use config::HomebedConfig;
pub use context::{HostContext, SharedResources};
pub use error::{ExecutorError, OrchestratorError, Result, TeardownReport};
pub use executor::{SerialExecutor, TaskHandle, TaskState};
pub use firewall::{Firewall, FirewallRule, IptablesFirewall, RuleOp, Verdict};
pub use host::{CommandOutput, DryRunRunner, HostCommand, HostRunner, SystemRunner};
pub use network::{NetworkMode, NetworkState, VirtualNetwork};
pub use provision::{DeviceProvisioner, DeviceRequest, ProvisionedDevice};
pub use radio::{
    PetitionCounter, PipeBackend, PipePair, PlaceholderPipePair, RadioMode, SocatPipePair, VirtualRadioLink,
};
