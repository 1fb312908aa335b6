//! Shared state handed to every capability, link and network.

use std::fmt;
use std::sync::Arc;

use crate::capability::AdapterPool;
use crate::config::HomebedConfig;
use crate::executor::SerialExecutor;
use crate::firewall::{Firewall, IptablesFirewall};
use crate::host::{HostRunner, SystemRunner};
use crate::radio::{PetitionCounter, PipeBackend};

/// Pools shared by all devices of a process.
#[derive(Debug, Default)]
pub struct SharedResources {
    /// Leased virtual BLE adapters.
    pub adapters: AdapterPool,
    /// Source of radio link petition ids.
    pub petitions: PetitionCounter,
}

impl SharedResources {
    /// Creates empty pools.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Everything an operation needs to touch the host.
///
/// Cloning is cheap; clones share the same pools, executor and runner.
#[derive(Clone)]
pub struct HostContext {
    /// Executor serializing host mutations.
    pub executor: Arc<SerialExecutor>,
    /// Command runner.
    pub runner: Arc<dyn HostRunner>,
    /// Firewall used by home networks.
    pub firewall: Arc<dyn Firewall>,
    /// Shared pools.
    pub resources: Arc<SharedResources>,
    /// Configuration.
    pub config: Arc<HomebedConfig>,
    /// Pipe pair implementation for radio links.
    pub pipes: PipeBackend,
}

impl HostContext {
    /// Creates a builder.
    pub fn builder() -> HostContextBuilder {
        HostContextBuilder::default()
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("executor", &self.executor.name())
            .field("resources", &self.resources)
            .field("pipes", &self.pipes)
            .finish()
    }
}

/// Builder for [`HostContext`].
///
/// Unset parts default to the global executor, a [`SystemRunner`], an
/// [`IptablesFirewall`] over that runner, fresh pools and default config.
#[derive(Default)]
pub struct HostContextBuilder {
    executor: Option<Arc<SerialExecutor>>,
    runner: Option<Arc<dyn HostRunner>>,
    firewall: Option<Arc<dyn Firewall>>,
    resources: Option<Arc<SharedResources>>,
    config: Option<HomebedConfig>,
    pipes: PipeBackend,
}

impl HostContextBuilder {
    /// Sets the executor.
    pub fn executor(mut self, executor: Arc<SerialExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the command runner.
    pub fn runner(mut self, runner: Arc<dyn HostRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Sets the firewall.
    pub fn firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.firewall = Some(firewall);
        self
    }

    /// Shares existing pools.
    pub fn resources(mut self, resources: Arc<SharedResources>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: HomebedConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the pipe pair implementation used by radio links.
    pub fn pipe_backend(mut self, pipes: PipeBackend) -> Self {
        self.pipes = pipes;
        self
    }

    /// Builds the context.
    pub fn build(self) -> HostContext {
        let config = self.config.unwrap_or_default();
        let runner: Arc<dyn HostRunner> = self.runner.unwrap_or_else(|| Arc::new(SystemRunner::new()));
        let firewall = self.firewall.unwrap_or_else(|| {
            Arc::new(IptablesFirewall::new(
                Arc::clone(&runner),
                config.network.iptables.clone(),
                config.network.firewall_chain.clone(),
            ))
        });

        HostContext {
            executor: self.executor.unwrap_or_else(SerialExecutor::global),
            runner,
            firewall,
            resources: self.resources.unwrap_or_default(),
            config: Arc::new(config),
            pipes: self.pipes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DryRunRunner;

    #[test]
    fn test_builder_defaults() {
        let ctx = HostContext::builder().runner(Arc::new(DryRunRunner::new())).build();
        assert_eq!(ctx.config.radio.port_group_size, 34);
        assert!(ctx.executor.is_running());
        assert!(ctx.resources.adapters.is_empty());
        assert_eq!(ctx.pipes, PipeBackend::Socat);
    }

    #[test]
    fn test_clones_share_pools() {
        let resources = Arc::new(SharedResources::new());
        let a = HostContext::builder()
            .runner(Arc::new(DryRunRunner::new()))
            .resources(Arc::clone(&resources))
            .build();
        let b = a.clone();

        a.resources.petitions.next();
        assert_eq!(b.resources.petitions.current(), 1);
        assert_eq!(resources.petitions.current(), 1);
    }
}
