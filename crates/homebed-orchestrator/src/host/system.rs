//! `std::process` backed runners.

use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{CommandOutput, HostCommand, HostRunner, ManagedProcess, ProcessCommand, Signal, SpawnSpec};
use crate::error::{OrchestratorError, Result};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs commands on the local host.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Creates a new system runner.
    pub fn new() -> Self {
        Self
    }

    fn command_for(cmd: &HostCommand) -> Result<Command> {
        match cmd {
            HostCommand::Shell(line) => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(line);
                Ok(command)
            }
            HostCommand::Argv(args) => {
                let (program, rest) = args
                    .split_first()
                    .ok_or_else(|| OrchestratorError::command_failed("<empty>", "empty argv"))?;
                let mut command = Command::new(program);
                command.args(rest);
                Ok(command)
            }
        }
    }
}

impl HostRunner for SystemRunner {
    fn run(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        debug!(command = %cmd, "Executing command");
        let output = Self::command_for(cmd)?
            .stdin(Stdio::null())
            .output()
            .map_err(|e| OrchestratorError::command_failed(cmd.to_string(), e.to_string()))?;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(command = %cmd, exit_code = result.exit_code, "Command finished");
        Ok(result)
    }

    fn spawn(&self, spec: SpawnSpec) -> Result<Box<dyn ManagedProcess>> {
        let command_line = spec.command_line();
        let mut command = Command::new(&spec.program);
        command.args(&spec.args).envs(&spec.env);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        match spec.stdio {
            Some(file) => {
                let stdout = file.try_clone()?;
                command.stdin(Stdio::from(file)).stdout(Stdio::from(stdout));
            }
            None => {
                command.stdin(Stdio::null()).stdout(Stdio::null());
            }
        }
        command.stderr(Stdio::null());

        let child = command
            .spawn()
            .map_err(|e| OrchestratorError::child_process(format!("{command_line}: {e}")))?;
        info!(command = %command_line, pid = child.id(), "Spawned child process");

        Ok(Box::new(SystemProcess {
            child,
            command_line,
            stop_grace: spec.stop_grace,
        }))
    }
}

/// A child process started by [`SystemRunner`].
#[derive(Debug)]
pub struct SystemProcess {
    child: Child,
    command_line: String,
    stop_grace: Duration,
}

impl SystemProcess {
    fn wait_for_exit(&mut self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl ManagedProcess for SystemProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let pid = self.child.id();
        let term = ProcessCommand::kill(pid, Signal::Term);
        match SystemRunner.run(&term) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(pid, reason = %out.failure_reason(), "SIGTERM delivery failed"),
            Err(e) => warn!(pid, error = %e, "SIGTERM delivery failed"),
        }

        if !self.wait_for_exit(self.stop_grace) {
            warn!(pid, command = %self.command_line, "Process ignored SIGTERM, sending SIGKILL");
            self.child.kill()?;
        }
        self.child.wait()?;
        info!(pid, command = %self.command_line, "Child process terminated");
        Ok(())
    }
}

/// Subnet reported for every network in dry-run mode (TEST-NET-1).
pub const DRY_RUN_SUBNET: &str = "192.0.2.0/24";
/// Gateway reported for every network in dry-run mode.
pub const DRY_RUN_GATEWAY: &str = "192.0.2.1";
const DRY_RUN_INTERFACE: &str = "dry0";

/// Logs commands instead of executing them.
///
/// Spawned processes are placeholders. Queries the orchestration depends on
/// get placeholder answers: `hciconfig` lists the configured number of
/// virtual adapters, `docker network inspect` reports [`DRY_RUN_SUBNET`],
/// the host routing queries describe a `dry0` interface on that subnet, and
/// firewall rule checks report the rule as absent so inserts get logged.
/// Everything else succeeds with empty output.
///
/// Radio links additionally need a placeholder pipe backend, as no socat
/// runs to create their endpoints.
#[derive(Debug)]
pub struct DryRunRunner {
    next_pid: AtomicU32,
    virtual_adapters: u32,
}

impl Default for DryRunRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunRunner {
    /// Creates a dry-run runner reporting two virtual adapters.
    pub fn new() -> Self {
        Self::with_adapters(2)
    }

    /// Creates a dry-run runner reporting `count` virtual adapters.
    pub fn with_adapters(count: u32) -> Self {
        Self {
            next_pid: AtomicU32::new(1),
            virtual_adapters: count,
        }
    }

    fn placeholder(&self, args: &[String]) -> CommandOutput {
        let program = args
            .first()
            .map(|p| p.rsplit('/').next().unwrap_or(p.as_str()))
            .unwrap_or_default();
        let rest: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();

        match (program, rest.as_slice()) {
            ("hciconfig", _) => CommandOutput::ok(
                (0..self.virtual_adapters)
                    .map(|i| format!("hci{i}:\tType: Primary  Bus: Virtual\n"))
                    .collect::<String>(),
            ),
            (_, ["network", "inspect", ..]) => CommandOutput::ok(format!(
                r#"[{{"IPAM": {{"Config": [{{"Subnet": "{DRY_RUN_SUBNET}", "Gateway": "{DRY_RUN_GATEWAY}"}}]}}}}]"#
            )),
            (_, ["route", "show", "default", ..]) => {
                CommandOutput::ok(format!("default via {DRY_RUN_GATEWAY} dev {DRY_RUN_INTERFACE}\n"))
            }
            (_, ["-o", "-4", "addr", "show", ..]) => CommandOutput::ok(format!(
                "2: {DRY_RUN_INTERFACE}    inet 192.0.2.10/24 scope global {DRY_RUN_INTERFACE}\n"
            )),
            (_, ["-C", ..]) => CommandOutput::new(1, "", ""),
            _ => CommandOutput::default(),
        }
    }
}

impl HostRunner for DryRunRunner {
    fn run(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        info!(command = %cmd, "Dry-run: would execute");
        Ok(match cmd {
            HostCommand::Argv(args) => self.placeholder(args),
            HostCommand::Shell(_) => CommandOutput::default(),
        })
    }

    fn spawn(&self, spec: SpawnSpec) -> Result<Box<dyn ManagedProcess>> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        info!(command = %spec.command_line(), pid, "Dry-run: would spawn");
        Ok(Box::new(DryRunProcess { pid, running: true }))
    }
}

#[derive(Debug)]
struct DryRunProcess {
    pid: u32,
    running: bool,
}

impl ManagedProcess for DryRunProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        self.running
    }

    fn terminate(&mut self) -> Result<()> {
        info!(pid = self.pid, "Dry-run: would terminate");
        self.running = false;
        Ok(())
    }
}
