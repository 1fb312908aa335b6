//! Host command execution.
//!
//! All probing, killing, network creation and firewall manipulation goes
//! through a [`HostRunner`]. The production implementation is
//! [`SystemRunner`]; [`DryRunRunner`] logs instead of executing.

mod process;
mod system;

pub use process::{ProcessCommand, Signal};
pub use system::{DryRunRunner, SystemRunner, DRY_RUN_GATEWAY, DRY_RUN_SUBNET};

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// A command line to run on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// A line interpreted by `sh -c`, pipes and all.
    Shell(String),
    /// A program followed by its arguments, executed without a shell.
    Argv(Vec<String>),
}

impl HostCommand {
    /// Creates a shell command.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::Shell(line.into())
    }

    /// Creates an argv command.
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(args.into_iter().map(Into::into).collect())
    }

    /// Returns the program name, if any.
    pub fn program(&self) -> Option<&str> {
        match self {
            Self::Shell(_) => Some("sh"),
            Self::Argv(args) => args.first().map(String::as_str),
        }
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(line) => write!(f, "{line}"),
            Self::Argv(args) => write!(f, "{}", args.join(" ")),
        }
    }
}

/// Output from a finished host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code of the command (-1 when killed by a signal).
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Creates a new command output.
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Creates a successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::new(0, stdout, "")
    }

    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stdout lines.
    pub fn stdout_lines(&self) -> Vec<&str> {
        self.stdout.lines().collect()
    }

    /// Returns stderr trimmed, or the exit code when stderr is empty.
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}", self.exit_code)
        } else {
            stderr.to_string()
        }
    }
}

/// Describes a long-running child process to launch.
#[derive(Debug)]
pub struct SpawnSpec {
    /// Program to execute (looked up on `PATH` when not absolute).
    pub program: String,
    /// Positional arguments.
    pub args: Vec<String>,
    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Descriptor wired to the child's stdin and stdout.
    pub stdio: Option<File>,
    /// Working directory of the child; inherited when unset.
    pub current_dir: Option<PathBuf>,
    /// Grace period between SIGTERM and SIGKILL on terminate.
    pub stop_grace: Duration,
}

impl SpawnSpec {
    /// Creates a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stdio: None,
            current_dir: None,
            stop_grace: Duration::from_secs(5),
        }
    }

    /// Runs the child in `dir`.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Binds the child's stdin and stdout to `file`.
    pub fn stdio(mut self, file: File) -> Self {
        self.stdio = Some(file);
        self
    }

    /// Sets the terminate grace period.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Returns the command line for logging.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A child process owned by the orchestrator.
pub trait ManagedProcess: Send + fmt::Debug {
    /// Returns the OS process id.
    fn id(&self) -> u32;

    /// Returns true while the process has not exited.
    fn is_running(&mut self) -> bool;

    /// Asks the process to exit, escalating to SIGKILL after the grace period.
    ///
    /// Terminating a process that already exited is not an error.
    fn terminate(&mut self) -> Result<()>;
}

/// Executes commands on the host.
pub trait HostRunner: Send + Sync {
    /// Runs `cmd` to completion and captures its output.
    ///
    /// A non-zero exit status is reported through [`CommandOutput`], not as an
    /// error. `Err` means the command could not be executed at all.
    fn run(&self, cmd: &HostCommand) -> Result<CommandOutput>;

    /// Launches a long-running child process.
    fn spawn(&self, spec: SpawnSpec) -> Result<Box<dyn ManagedProcess>>;
}
