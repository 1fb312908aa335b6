//! Source/destination firewall rules.
//!
//! Home networks isolate their devices from each other with three iptables
//! rules. The [`Firewall`] trait installs or removes one rule at a time and
//! is idempotent: adding a present rule or removing an absent one is a no-op.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::host::{HostCommand, HostRunner};

/// What happens to matching packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Let the packet through.
    Accept,
    /// Silently discard the packet.
    Drop,
}

impl Verdict {
    /// Returns the iptables target name.
    pub fn target(&self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target())
    }
}

/// Whether a rule is being installed or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    /// Install the rule.
    Add,
    /// Remove the rule.
    Remove,
}

/// One source/destination rule. Addresses are plain IPs or CIDR blocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    /// Source address or subnet.
    pub source: String,
    /// Destination address or subnet.
    pub destination: String,
    /// Verdict for matching packets.
    pub verdict: Verdict,
}

impl FirewallRule {
    /// Creates a rule.
    pub fn new(source: impl Into<String>, destination: impl Into<String>, verdict: Verdict) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            verdict,
        }
    }

    /// The rule set isolating a home segment: peers may not talk to each
    /// other, but everyone may talk to and hear from the gateway.
    pub fn isolation_set(subnet: &str, gateway: &str) -> [FirewallRule; 3] {
        [
            FirewallRule::new(subnet, subnet, Verdict::Drop),
            FirewallRule::new(gateway, subnet, Verdict::Accept),
            FirewallRule::new(subnet, gateway, Verdict::Accept),
        ]
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} {}", self.source, self.destination, self.verdict)
    }
}

/// Installs and removes individual firewall rules.
pub trait Firewall: Send + Sync {
    /// Applies `op` to `rule`. Must be idempotent.
    fn apply(&self, rule: &FirewallRule, op: RuleOp) -> Result<()>;
}

/// Builder for the iptables argument vectors of one rule.
#[derive(Debug, Clone)]
pub struct IptablesCommand {
    binary: String,
    chain: String,
}

impl IptablesCommand {
    /// Creates a builder for `binary` operating on `chain`.
    pub fn new(binary: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            chain: chain.into(),
        }
    }

    fn build(&self, action: &str, rule: &FirewallRule) -> HostCommand {
        HostCommand::argv([
            self.binary.as_str(),
            action,
            self.chain.as_str(),
            "-s",
            rule.source.as_str(),
            "-d",
            rule.destination.as_str(),
            "-j",
            rule.verdict.target(),
        ])
    }

    /// `-C`: exits 0 when the rule is present.
    pub fn check(&self, rule: &FirewallRule) -> HostCommand {
        self.build("-C", rule)
    }

    /// `-I`: inserts at the head of the chain.
    pub fn insert(&self, rule: &FirewallRule) -> HostCommand {
        self.build("-I", rule)
    }

    /// `-D`: deletes one matching rule.
    pub fn delete(&self, rule: &FirewallRule) -> HostCommand {
        self.build("-D", rule)
    }
}

/// [`Firewall`] backed by the iptables binary.
pub struct IptablesFirewall {
    runner: Arc<dyn HostRunner>,
    command: IptablesCommand,
}

impl IptablesFirewall {
    /// Creates a firewall driving `binary` on `chain` through `runner`.
    pub fn new(runner: Arc<dyn HostRunner>, binary: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            runner,
            command: IptablesCommand::new(binary, chain),
        }
    }

    fn is_present(&self, rule: &FirewallRule) -> Result<bool> {
        Ok(self.runner.run(&self.command.check(rule))?.success())
    }
}

impl Firewall for IptablesFirewall {
    fn apply(&self, rule: &FirewallRule, op: RuleOp) -> Result<()> {
        let present = self.is_present(rule)?;
        let cmd = match (op, present) {
            (RuleOp::Add, false) => self.command.insert(rule),
            (RuleOp::Remove, true) => self.command.delete(rule),
            _ => {
                debug!(rule = %rule, ?op, "Firewall rule already in desired state");
                return Ok(());
            }
        };

        let out = self.runner.run(&cmd)?;
        if !out.success() {
            return Err(OrchestratorError::provisioning_failure(
                format!("firewall rule {rule}"),
                cmd.to_string(),
                out.failure_reason(),
            ));
        }
        info!(rule = %rule, ?op, "Firewall rule applied");
        Ok(())
    }
}
