//! Home network segments.
//!
//! A [`VirtualNetwork`] is one docker network plus, in standard mode, the
//! three firewall rules isolating its members from each other. Networks
//! whose name contains the parent-interface marker are bound to the host's
//! default interface with the ipvlan driver instead and get no rules.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::context::HostContext;
use crate::error::{OrchestratorError, Result, TeardownReport};
use crate::firewall::{Firewall, FirewallRule, RuleOp};
use crate::executor::SerialExecutor;
use crate::host::{CommandOutput, HostCommand, HostRunner};

/// How the network gets its addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Engine-assigned subnet, isolated by firewall rules.
    Standard,
    /// Host subnet shared through an ipvlan parent interface; flat topology.
    ParentInterface,
}

impl NetworkMode {
    /// Picks the mode from the network name.
    pub fn for_name(name: &str, marker: &str) -> Self {
        if !marker.is_empty() && name.contains(marker) {
            NetworkMode::ParentInterface
        } else {
            NetworkMode::Standard
        }
    }
}

/// Provisioning outcome of a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkState {
    /// Network exists and, in standard mode, is fully isolated.
    Ready,
    /// Something went wrong; the network must not be used.
    Degraded {
        /// What failed.
        reason: String,
    },
    /// Torn down.
    Closed,
}

impl NetworkState {
    /// Returns true only for [`NetworkState::Ready`].
    pub fn is_usable(&self) -> bool {
        matches!(self, NetworkState::Ready)
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Ready => f.write_str("ready"),
            NetworkState::Degraded { reason } => write!(f, "degraded: {reason}"),
            NetworkState::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InspectedNetwork {
    #[serde(rename = "IPAM")]
    ipam: Ipam,
}

#[derive(Debug, Deserialize)]
struct Ipam {
    #[serde(rename = "Config", default)]
    config: Option<Vec<IpamConfig>>,
}

#[derive(Debug, Deserialize)]
struct IpamConfig {
    #[serde(rename = "Subnet", default)]
    subnet: Option<String>,
    #[serde(rename = "Gateway", default)]
    gateway: Option<String>,
}

/// Addressing recovered from `docker network inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressing {
    /// Subnet in CIDR notation.
    pub subnet: String,
    /// Gateway address, when the engine reports one.
    pub gateway: Option<String>,
}

/// Parses the JSON array printed by `docker network inspect`.
pub fn parse_inspect(json: &str) -> Result<Addressing> {
    let networks: Vec<InspectedNetwork> = serde_json::from_str(json)?;
    let network = networks
        .into_iter()
        .next()
        .ok_or_else(|| OrchestratorError::serialization("inspect returned no networks"))?;
    let mut configs = network.ipam.config.unwrap_or_default();
    if configs.len() > 1 {
        warn!(count = configs.len(), "Network has several IPAM configs, using the first");
    }
    if configs.is_empty() {
        return Err(OrchestratorError::serialization("network has no IPAM config"));
    }
    let first = configs.swap_remove(0);
    let subnet = first
        .subnet
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OrchestratorError::serialization("IPAM config has no subnet"))?;
    Ok(Addressing {
        subnet,
        gateway: first.gateway.filter(|g| !g.is_empty()),
    })
}

/// The host's default route: `default via <gateway> dev <interface> ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    /// Next-hop address.
    pub gateway: String,
    /// Outgoing interface.
    pub interface: String,
}

/// Parses the first line of `ip route show default`.
pub fn parse_default_route(output: &str) -> Option<DefaultRoute> {
    let line = output.lines().find(|l| l.trim_start().starts_with("default"))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let value_after = |key: &str| {
        tokens
            .windows(2)
            .find(|w| w[0] == key)
            .map(|w| w[1].to_string())
    };
    Some(DefaultRoute {
        gateway: value_after("via")?,
        interface: value_after("dev")?,
    })
}

/// Finds the first IPv4 `inet a.b.c.d/n` in `ip -o -4 addr show` output and
/// returns the network it belongs to, e.g. `192.168.1.0/24`.
pub fn parse_interface_subnet(output: &str) -> Option<String> {
    let cidr = output
        .split_whitespace()
        .skip_while(|t| *t != "inet")
        .nth(1)?;
    network_of(cidr)
}

fn network_of(cidr: &str) -> Option<String> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    let network = Ipv4Addr::from(u32::from(addr) & mask);
    Some(format!("{network}/{prefix}"))
}

/// One home network segment.
pub struct VirtualNetwork {
    name: String,
    internal: bool,
    mode: NetworkMode,
    subnet: Option<String>,
    gateway: Option<String>,
    parent: Option<String>,
    state: NetworkState,
    installed: Vec<FirewallRule>,
    executor: Arc<SerialExecutor>,
    runner: Arc<dyn HostRunner>,
    firewall: Arc<dyn Firewall>,
    config: NetworkConfig,
}

impl VirtualNetwork {
    /// Creates and provisions a network using the context's executor, runner,
    /// firewall and network configuration.
    ///
    /// Never fails: problems are logged and leave the network
    /// [`Degraded`](NetworkState::Degraded).
    pub fn create(ctx: &HostContext, name: impl Into<String>, internal: bool) -> Self {
        Self::with_collaborators(
            name,
            internal,
            Arc::clone(&ctx.executor),
            Arc::clone(&ctx.runner),
            Arc::clone(&ctx.firewall),
            ctx.config.network.clone(),
        )
    }

    /// Creates and provisions a network with explicit collaborators.
    ///
    /// Host commands and firewall changes run on `executor`.
    pub fn with_collaborators(
        name: impl Into<String>,
        internal: bool,
        executor: Arc<SerialExecutor>,
        runner: Arc<dyn HostRunner>,
        firewall: Arc<dyn Firewall>,
        config: NetworkConfig,
    ) -> Self {
        let name = name.into();
        let mode = NetworkMode::for_name(&name, &config.parent_interface_marker);
        let mut network = Self {
            name,
            internal,
            mode,
            subnet: None,
            gateway: None,
            parent: None,
            state: NetworkState::Ready,
            installed: Vec::new(),
            executor,
            runner,
            firewall,
            config,
        };

        let outcome = match mode {
            NetworkMode::Standard => network.provision_standard(),
            NetworkMode::ParentInterface => network.provision_parent_interface(),
        };
        if let Err(e) = outcome {
            error!(network = %network.name, error = %e, "Network provisioning failed");
            network.state = NetworkState::Degraded { reason: e.to_string() };
        } else {
            info!(
                network = %network.name,
                subnet = ?network.subnet,
                gateway = ?network.gateway,
                "Network ready"
            );
        }
        network
    }

    fn docker(&self, args: &[&str]) -> HostCommand {
        HostCommand::argv(std::iter::once(self.config.docker.as_str()).chain(args.iter().copied()))
    }

    fn execute(&self, cmd: HostCommand) -> Result<CommandOutput> {
        let runner = Arc::clone(&self.runner);
        self.executor.run(move || runner.run(&cmd))
    }

    fn apply_rule(&self, rule: FirewallRule, op: RuleOp) -> Result<()> {
        let firewall = Arc::clone(&self.firewall);
        match op {
            RuleOp::Add => self.executor.run(move || firewall.apply(&rule, op)),
            RuleOp::Remove => self.executor.run_or_inline(move || firewall.apply(&rule, op)),
        }
    }

    fn run_checked(&self, resource: &str, cmd: HostCommand) -> Result<String> {
        let out = self.execute(cmd.clone())?;
        if !out.success() {
            return Err(OrchestratorError::provisioning_failure(
                resource,
                cmd.to_string(),
                out.failure_reason(),
            ));
        }
        Ok(out.stdout)
    }

    fn provision_standard(&mut self) -> Result<()> {
        let mut create = vec!["network", "create", self.name.as_str()];
        if self.internal {
            create.push("--internal");
        }
        // The network may exist already; inspection decides.
        if let Err(e) = self.run_checked("docker network", self.docker(&create)) {
            warn!(network = %self.name, error = %e, "Network create failed, inspecting anyway");
        }

        let inspect = self.run_checked("docker network", self.docker(&["network", "inspect", self.name.as_str()]))?;
        let addressing = parse_inspect(&inspect).map_err(|e| {
            OrchestratorError::invalid_state(format!(
                "inspection failed ({e}); network {} may exist without isolation rules",
                self.name
            ))
        })?;
        self.subnet = Some(addressing.subnet.clone());
        let gateway = addressing.gateway.ok_or_else(|| {
            OrchestratorError::invalid_state(format!("network {} reports no gateway", self.name))
        })?;
        self.gateway = Some(gateway.clone());

        self.install_isolation(&addressing.subnet, &gateway)
    }

    fn install_isolation(&mut self, subnet: &str, gateway: &str) -> Result<()> {
        for rule in FirewallRule::isolation_set(subnet, gateway) {
            match self.apply_rule(rule.clone(), RuleOp::Add) {
                Ok(()) => self.installed.push(rule),
                Err(e) => {
                    // Never leave part of the set behind.
                    let report = self.remove_installed_rules();
                    if !report.is_clean() {
                        warn!(network = %self.name, report = %report, "Partial rule rollback");
                    }
                    return Err(e);
                }
            }
        }
        debug!(network = %self.name, rules = self.installed.len(), "Isolation rules installed");
        Ok(())
    }

    fn provision_parent_interface(&mut self) -> Result<()> {
        let route_out = self.run_checked(
            "default route",
            HostCommand::argv([self.config.ip.as_str(), "route", "show", "default"]),
        )?;
        let route = parse_default_route(&route_out)
            .ok_or_else(|| OrchestratorError::invalid_state("host has no default route"))?;

        let addr_out = self.run_checked(
            "parent interface",
            HostCommand::argv([self.config.ip.as_str(), "-o", "-4", "addr", "show", "dev", route.interface.as_str()]),
        )?;
        let subnet = parse_interface_subnet(&addr_out).ok_or_else(|| {
            OrchestratorError::invalid_state(format!("{} has no IPv4 address", route.interface))
        })?;

        let parent_opt = format!("parent={}", route.interface);
        let mut create = vec![
            "network",
            "create",
            "-d",
            "ipvlan",
            "--subnet",
            subnet.as_str(),
            "--gateway",
            route.gateway.as_str(),
            "-o",
            parent_opt.as_str(),
        ];
        if self.internal {
            create.push("--internal");
        }
        create.push(self.name.as_str());
        self.run_checked("docker network", self.docker(&create))?;

        self.subnet = Some(subnet);
        self.parent = Some(route.interface);
        Ok(())
    }

    fn remove_installed_rules(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        let installed = std::mem::take(&mut self.installed);
        for rule in installed.into_iter().rev() {
            let step = format!("remove rule {rule}");
            report.check(&step, self.apply_rule(rule, RuleOp::Remove));
        }
        report
    }

    /// Tears the network down: rules first, then the docker network.
    ///
    /// A no-op once `subnet` is unset.
    pub fn close(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        if self.subnet.is_none() {
            return report;
        }

        info!(network = %self.name, "Closing network");
        report.merge(self.remove_installed_rules());
        let runner = Arc::clone(&self.runner);
        let rm = self.docker(&["network", "rm", self.name.as_str()]);
        match self.executor.run_or_inline(move || runner.run(&rm)) {
            Ok(out) if out.success() => {}
            Ok(out) => report.record("docker network rm", out.failure_reason()),
            Err(e) => report.record("docker network rm", e),
        }

        self.subnet = None;
        self.gateway = None;
        self.parent = None;
        self.state = NetworkState::Closed;
        report
    }

    /// Returns the network name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the network has no external access.
    pub fn internal(&self) -> bool {
        self.internal
    }

    /// Returns the provisioning mode.
    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    /// Returns the subnet; `None` means not provisioned or torn down.
    pub fn subnet(&self) -> Option<&str> {
        self.subnet.as_deref()
    }

    /// Returns the gateway. Always `None` in parent-interface mode.
    pub fn gateway(&self) -> Option<&str> {
        self.gateway.as_deref()
    }

    /// Returns the ipvlan parent interface.
    pub fn parent_interface(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Returns the provisioning state.
    pub fn state(&self) -> &NetworkState {
        &self.state
    }

    /// Returns the firewall rules currently installed for this network.
    pub fn installed_rules(&self) -> &[FirewallRule] {
        &self.installed
    }
}

impl fmt::Debug for VirtualNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualNetwork")
            .field("name", &self.name)
            .field("internal", &self.internal)
            .field("mode", &self.mode)
            .field("subnet", &self.subnet)
            .field("gateway", &self.gateway)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for VirtualNetwork {
    fn drop(&mut self) {
        let report = self.close();
        if !report.is_clean() {
            warn!(network = %self.name, report = %report, "Network closed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::Verdict;
    use crate::host::CommandOutput;
    use crate::testing::{RecordingFirewall, ScriptedRunner};

    const INSPECT: &str = r#"[{
        "Name": "home0",
        "Driver": "bridge",
        "IPAM": {
            "Driver": "default",
            "Options": {},
            "Config": [{"Subnet": "172.18.0.0/16", "Gateway": "172.18.0.1"}]
        }
    }]"#;

    fn network(runner: &Arc<ScriptedRunner>, firewall: &Arc<RecordingFirewall>, name: &str, internal: bool) -> VirtualNetwork {
        VirtualNetwork::with_collaborators(
            name,
            internal,
            Arc::new(SerialExecutor::started("network-test").unwrap()),
            runner.clone(),
            firewall.clone(),
            NetworkConfig::default(),
        )
    }

    #[test]
    fn test_mode_from_name() {
        assert_eq!(NetworkMode::for_name("home0", "ipvlan"), NetworkMode::Standard);
        assert_eq!(NetworkMode::for_name("home-ipvlan", "ipvlan"), NetworkMode::ParentInterface);
        assert_eq!(NetworkMode::for_name("home-ipvlan", ""), NetworkMode::Standard);
    }

    #[test]
    fn test_parse_inspect() {
        let addressing = parse_inspect(INSPECT).unwrap();
        assert_eq!(addressing.subnet, "172.18.0.0/16");
        assert_eq!(addressing.gateway.as_deref(), Some("172.18.0.1"));

        assert!(parse_inspect("[]").is_err());
        assert!(parse_inspect(r#"[{"IPAM": {"Config": null}}]"#).is_err());
        assert!(parse_inspect("not json").is_err());
    }

    #[test]
    fn test_parse_host_routing() {
        let route = parse_default_route("default via 192.168.1.1 dev eth0 proto dhcp metric 100\n").unwrap();
        assert_eq!(route.gateway, "192.168.1.1");
        assert_eq!(route.interface, "eth0");
        assert!(parse_default_route("").is_none());

        let addr = "2: eth0    inet 192.168.1.23/24 brd 192.168.1.255 scope global dynamic eth0\n";
        assert_eq!(parse_interface_subnet(addr).as_deref(), Some("192.168.1.0/24"));
        assert_eq!(network_of("10.1.2.3/8").as_deref(), Some("10.0.0.0/8"));
        assert_eq!(network_of("10.1.2.3/0").as_deref(), Some("0.0.0.0/0"));
        assert!(network_of("10.1.2.3/33").is_none());
    }

    #[test]
    fn test_standard_network_installs_and_removes_rule_set() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("network inspect", CommandOutput::ok(INSPECT));
        let firewall = Arc::new(RecordingFirewall::new());

        let mut net = network(&runner, &firewall, "home0", false);
        assert!(net.state().is_usable());
        assert_eq!(net.subnet(), Some("172.18.0.0/16"));
        assert_eq!(net.gateway(), Some("172.18.0.1"));
        assert_eq!(runner.count_matching("docker network create home0"), 1);
        assert_eq!(runner.count_matching("--internal"), 0);

        let added = firewall.applied(RuleOp::Add);
        assert_eq!(added.len(), 3);
        assert_eq!(added[0], FirewallRule::new("172.18.0.0/16", "172.18.0.0/16", Verdict::Drop));
        assert_eq!(added[1], FirewallRule::new("172.18.0.1", "172.18.0.0/16", Verdict::Accept));
        assert_eq!(added[2], FirewallRule::new("172.18.0.0/16", "172.18.0.1", Verdict::Accept));

        assert!(net.close().is_clean());
        let removed = firewall.applied(RuleOp::Remove);
        assert_eq!(removed.len(), 3);
        for rule in &added {
            assert!(removed.contains(rule));
        }
        assert_eq!(runner.count_matching("docker network rm home0"), 1);
        assert_eq!(net.state(), &NetworkState::Closed);
        assert!(net.subnet().is_none());

        // Second close touches nothing.
        assert!(net.close().is_clean());
        assert_eq!(firewall.applied(RuleOp::Remove).len(), 3);
        assert_eq!(runner.count_matching("docker network rm"), 1);
    }

    #[test]
    fn test_close_collects_failures_and_resets() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("network inspect", CommandOutput::ok(INSPECT));
        runner.respond("network rm", CommandOutput::new(1, "", "error: network home0 has active endpoints"));
        let firewall = Arc::new(RecordingFirewall::new());
        let drop_rule = FirewallRule::new("172.18.0.0/16", "172.18.0.0/16", Verdict::Drop);
        firewall.fail_removal_of(drop_rule.clone());

        let mut net = network(&runner, &firewall, "home0", false);
        assert!(net.state().is_usable());

        let report = net.close();
        assert_eq!(report.issues().len(), 2);
        assert!(report.issues()[0].step.starts_with("remove rule"));
        assert_eq!(report.issues()[1].step, "docker network rm");
        assert!(report.issues()[1].message.contains("active endpoints"));

        // The other two rules were still removed and the docker network still attempted.
        assert_eq!(firewall.applied(RuleOp::Remove).len(), 2);
        assert_eq!(firewall.active(), vec![drop_rule]);
        assert_eq!(runner.count_matching("docker network rm home0"), 1);
        assert!(net.subnet().is_none());
        assert_eq!(net.state(), &NetworkState::Closed);
        assert!(net.installed_rules().is_empty());

        assert!(net.close().is_clean());
        assert_eq!(runner.count_matching("docker network rm"), 1);
    }

    #[test]
    fn test_close_after_executor_stopped() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("network inspect", CommandOutput::ok(INSPECT));
        let firewall = Arc::new(RecordingFirewall::new());
        let executor = Arc::new(SerialExecutor::started("network-test").unwrap());

        let mut net = VirtualNetwork::with_collaborators(
            "home0",
            false,
            Arc::clone(&executor),
            runner.clone(),
            firewall.clone(),
            NetworkConfig::default(),
        );
        executor.stop();

        assert!(net.close().is_clean());
        assert!(firewall.active().is_empty());
        assert_eq!(runner.count_matching("docker network rm home0"), 1);
    }

    #[test]
    fn test_internal_flag() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("network inspect", CommandOutput::ok(INSPECT));
        let firewall = Arc::new(RecordingFirewall::new());

        let net = network(&runner, &firewall, "lab", true);
        assert!(net.internal());
        assert_eq!(runner.count_matching("docker network create lab --internal"), 1);
    }

    #[test]
    fn test_inspection_failure_degrades() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("network inspect", CommandOutput::new(1, "", "Error: No such network: home0"));
        let firewall = Arc::new(RecordingFirewall::new());

        let mut net = network(&runner, &firewall, "home0", false);
        assert!(!net.state().is_usable());
        assert!(matches!(net.state(), NetworkState::Degraded { reason } if reason.contains("No such network")));
        assert!(net.subnet().is_none());
        assert!(firewall.applied(RuleOp::Add).is_empty());

        // With no subnet there is nothing to tear down.
        assert!(net.close().is_clean());
        assert_eq!(runner.count_matching("docker network rm"), 0);
    }

    #[test]
    fn test_unparseable_inspection_degrades() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("network inspect", CommandOutput::ok("[]"));
        let firewall = Arc::new(RecordingFirewall::new());

        let net = network(&runner, &firewall, "home0", false);
        assert!(matches!(net.state(), NetworkState::Degraded { reason } if reason.contains("without isolation rules")));
    }

    #[test]
    fn test_failed_rule_rolls_back_set() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("network inspect", CommandOutput::ok(INSPECT));
        let firewall = Arc::new(RecordingFirewall::new());
        firewall.fail_on(FirewallRule::new("172.18.0.0/16", "172.18.0.1", Verdict::Accept));

        let mut net = network(&runner, &firewall, "home0", false);
        assert!(!net.state().is_usable());
        assert!(net.installed_rules().is_empty());
        assert_eq!(firewall.applied(RuleOp::Add).len(), 2);
        assert_eq!(firewall.applied(RuleOp::Remove).len(), 2);
        assert!(firewall.active().is_empty());

        // The subnet is known, so close still removes the docker network.
        assert!(net.close().is_clean());
        assert_eq!(runner.count_matching("docker network rm home0"), 1);
        assert_eq!(firewall.applied(RuleOp::Remove).len(), 2);
    }

    #[test]
    fn test_parent_interface_network() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("route show default", CommandOutput::ok("default via 192.168.1.1 dev eth0 proto static\n"));
        runner.respond(
            "addr show dev eth0",
            CommandOutput::ok("2: eth0    inet 192.168.1.23/24 brd 192.168.1.255 scope global eth0\n"),
        );
        let firewall = Arc::new(RecordingFirewall::new());

        let mut net = network(&runner, &firewall, "home-ipvlan", false);
        assert_eq!(net.mode(), NetworkMode::ParentInterface);
        assert!(net.state().is_usable());
        assert_eq!(net.subnet(), Some("192.168.1.0/24"));
        assert!(net.gateway().is_none());
        assert_eq!(net.parent_interface(), Some("eth0"));
        assert_eq!(
            runner.count_matching(
                "docker network create -d ipvlan --subnet 192.168.1.0/24 --gateway 192.168.1.1 -o parent=eth0 home-ipvlan"
            ),
            1
        );
        assert!(firewall.applied(RuleOp::Add).is_empty());

        assert!(net.close().is_clean());
        assert!(firewall.applied(RuleOp::Remove).is_empty());
        assert_eq!(runner.count_matching("docker network rm home-ipvlan"), 1);
    }

    #[test]
    fn test_parent_interface_without_route() {
        let runner = Arc::new(ScriptedRunner::new());
        let firewall = Arc::new(RecordingFirewall::new());

        let net = network(&runner, &firewall, "home-ipvlan", false);
        assert!(matches!(net.state(), NetworkState::Degraded { .. }));
        assert!(net.subnet().is_none());
        assert_eq!(runner.count_matching("docker network create"), 0);
    }

    #[test]
    fn test_drop_closes() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("network inspect", CommandOutput::ok(INSPECT));
        let firewall = Arc::new(RecordingFirewall::new());

        drop(network(&runner, &firewall, "home0", false));
        assert_eq!(firewall.applied(RuleOp::Remove).len(), 3);
        assert_eq!(runner.count_matching("docker network rm home0"), 1);
    }
}
