//! Signals and process-control command builders.

use std::fmt;

use super::HostCommand;

/// Unix signals the orchestrator sends to processes it manages.
///
/// Escalation past SIGTERM goes through `Child::kill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (15) - Graceful termination request.
    Term,
}

impl Signal {
    /// Returns the signal number.
    pub fn number(&self) -> i32 {
        match self {
            Signal::Term => 15,
        }
    }

    /// Returns the signal name (without SIG prefix).
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Term => "TERM",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

/// Builders for process-control commands.
pub struct ProcessCommand;

impl ProcessCommand {
    /// `kill -<n> <pid>`
    pub fn kill(pid: u32, signal: Signal) -> HostCommand {
        HostCommand::argv(["kill".to_string(), format!("-{}", signal.number()), pid.to_string()])
    }

    /// `killall <name>`: signals every process with that name, whoever owns it.
    pub fn killall(name: &str) -> HostCommand {
        HostCommand::argv(["killall", name])
    }

    /// `pgrep -f <pattern>`: exits 0 when some command line matches.
    pub fn pgrep_full(pattern: &str) -> HostCommand {
        HostCommand::argv(["pgrep", "-f", pattern])
    }
}
