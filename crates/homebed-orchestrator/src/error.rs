//! Error types for the orchestrator crate.
//!
//! Acquisition paths return [`OrchestratorError`]. Teardown paths never fail:
//! they collect problems into a [`TeardownReport`] and keep going.

use std::fmt;

use thiserror::Error;
use tracing::warn;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur while provisioning host resources.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A pooled resource has no free entries left.
    #[error("{resource} exhausted: {detail}")]
    ResourceExhausted {
        /// The pool that ran dry.
        resource: String,
        /// What the caller can do about it.
        detail: String,
    },

    /// A shared daemon never reached the running state.
    #[error("daemon {daemon} failed to start: {reason}")]
    DaemonStartFailure {
        /// Daemon name.
        daemon: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A host command used for provisioning returned non-zero.
    #[error("failed to provision {resource}: `{command}` failed: {stderr}")]
    ProvisioningFailure {
        /// The resource being provisioned.
        resource: String,
        /// The command line that failed.
        command: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A child process could not be spawned or controlled.
    #[error("child process failure: {0}")]
    ChildProcessFailure(String),

    /// A host command could not be executed at all.
    #[error("command failed: {command} - {reason}")]
    CommandFailed {
        /// The command line.
        command: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The serial executor rejected or lost a task.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// An object was used in a state that does not allow the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl OrchestratorError {
    /// Creates a resource exhausted error.
    pub fn resource_exhausted(resource: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            detail: detail.into(),
        }
    }

    /// Creates a daemon start failure.
    pub fn daemon_start_failure(daemon: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DaemonStartFailure {
            daemon: daemon.into(),
            reason: reason.into(),
        }
    }

    /// Creates a provisioning failure.
    pub fn provisioning_failure(
        resource: impl Into<String>,
        command: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::ProvisioningFailure {
            resource: resource.into(),
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Creates a child process failure.
    pub fn child_process(reason: impl Into<String>) -> Self {
        Self::ChildProcessFailure(reason.into())
    }

    /// Creates a command failed error.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState(reason.into())
    }

    /// Creates a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }

    /// Creates a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Returns true if the pool simply ran out of entries.
    ///
    /// Callers may choose to wait and retry on exhaustion, while daemon
    /// failures point at a broken host.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    /// Returns true if this error aborts a device acquisition.
    pub fn is_fatal_acquisition(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. }
                | Self::DaemonStartFailure { .. }
                | Self::ProvisioningFailure { .. }
                | Self::ChildProcessFailure(_)
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Errors raised by the serial executor itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// The executor has been stopped and accepts no more work.
    #[error("executor is not running")]
    NotRunning,

    /// `start()` was called twice.
    #[error("executor already started")]
    AlreadyStarted,

    /// `start()` was called after `stop()`.
    #[error("executor was stopped and cannot be restarted")]
    Stopped,

    /// The executor shut down before the task ran.
    #[error("task abandoned by executor shutdown")]
    Abandoned,

    /// The task panicked while running on the worker.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Another holder of the handle already took the result.
    #[error("task result already taken")]
    ResultTaken,
}

/// A single problem seen during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownIssue {
    /// The teardown step that failed.
    pub step: String,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for TeardownIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// Accumulated outcome of a best-effort teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct TeardownReport {
    issues: Vec<TeardownIssue>,
}

impl TeardownReport {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an issue and logs it.
    pub fn record(&mut self, step: impl Into<String>, message: impl fmt::Display) {
        let issue = TeardownIssue {
            step: step.into(),
            message: message.to_string(),
        };
        warn!(step = %issue.step, error = %issue.message, "Teardown step failed");
        self.issues.push(issue);
    }

    /// Records the error of a fallible step, if any.
    pub fn check<T, E: fmt::Display>(&mut self, step: &str, result: std::result::Result<T, E>) {
        if let Err(e) = result {
            self.record(step, e);
        }
    }

    /// Folds another report into this one.
    pub fn merge(&mut self, other: TeardownReport) {
        self.issues.extend(other.issues);
    }

    /// Returns true if every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Returns the recorded issues.
    pub fn issues(&self) -> &[TeardownIssue] {
        &self.issues
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.issues.is_empty() {
            return write!(f, "clean");
        }
        let joined: Vec<String> = self.issues.iter().map(ToString::to_string).collect();
        write!(f, "{}", joined.join("; "))
    }
}
