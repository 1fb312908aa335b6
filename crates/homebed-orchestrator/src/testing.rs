//! Test doubles for host collaborators.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tempfile::TempDir;

use crate::config::HomebedConfig;
use crate::context::{HostContext, SharedResources};
use crate::error::{OrchestratorError, Result};
use crate::executor::SerialExecutor;
use crate::firewall::{Firewall, FirewallRule, RuleOp};
use crate::host::{CommandOutput, HostCommand, HostRunner, ManagedProcess, SpawnSpec};
use crate::radio::{PipeEndpoints, PipePair};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A context over `runner` with zero delays, a recording firewall, a private
/// executor and fresh pools. The returned directory holds radio work dirs.
pub(crate) fn context(runner: Arc<ScriptedRunner>) -> (HostContext, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = HomebedConfig::default();
    config.bluetooth.settle_delay_ms = 0;
    config.bluetooth.startup_grace_ms = 0;
    config.bluetooth.probe_interval_ms = 0;
    config.radio.pipe_timeout_ms = 50;
    config.radio.stop_grace_ms = 10;
    config.radio.work_dir = dir.path().join("radio");

    let ctx = HostContext::builder()
        .executor(Arc::new(SerialExecutor::started("test-executor").unwrap()))
        .runner(runner)
        .firewall(Arc::new(RecordingFirewall::new()))
        .resources(Arc::new(SharedResources::new()))
        .config(config)
        .build();
    (ctx, dir)
}

/// A spawn seen by [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub(crate) struct SpawnRecord {
    pub command_line: String,
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

#[derive(Debug)]
struct FakeEntry {
    pid: u32,
    name: String,
    command_line: String,
    running: bool,
    terminated: bool,
    stubborn: bool,
}

#[derive(Debug, Default)]
struct ProcessTable {
    entries: Vec<FakeEntry>,
    next_pid: u32,
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<(String, CommandOutput)>,
    commands: Vec<String>,
    spawned: Vec<SpawnRecord>,
    failing_spawns: Vec<String>,
    failing_runs: Vec<String>,
    stubborn_spawns: Vec<String>,
}

/// [`HostRunner`] answering from a script.
///
/// Scripted responses are matched by substring, most recent first. Unscripted
/// `pgrep -f` and `killall` consult a table of the fake processes spawned so
/// far; everything else succeeds with empty output.
#[derive(Debug, Default)]
pub(crate) struct ScriptedRunner {
    script: Mutex<Script>,
    table: Arc<Mutex<ProcessTable>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands containing `pattern` with `output`.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        lock(&self.script).rules.push((pattern.to_string(), output));
    }

    /// Makes spawns whose command line contains `pattern` fail.
    pub fn fail_spawns_of(&self, pattern: &str) {
        lock(&self.script).failing_spawns.push(pattern.to_string());
    }

    /// Makes running commands containing `pattern` fail to execute at all.
    pub fn fail_runs_of(&self, pattern: &str) {
        lock(&self.script).failing_runs.push(pattern.to_string());
    }

    /// Makes processes spawned from command lines containing `pattern`
    /// refuse to terminate through their handle.
    pub fn stubborn_spawns_of(&self, pattern: &str) {
        lock(&self.script).stubborn_spawns.push(pattern.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.script).commands.clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        lock(&self.script)
            .commands
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn spawned(&self) -> Vec<SpawnRecord> {
        lock(&self.script).spawned.clone()
    }

    pub fn spawned_matching(&self, pattern: &str) -> usize {
        lock(&self.script)
            .spawned
            .iter()
            .filter(|s| s.command_line.contains(pattern))
            .count()
    }

    /// Fake processes neither terminated nor killed.
    pub fn running_count(&self) -> usize {
        lock(&self.table).entries.iter().filter(|e| e.running).count()
    }

    /// Fake processes stopped through their handle.
    pub fn terminated_count(&self) -> usize {
        lock(&self.table).entries.iter().filter(|e| e.terminated).count()
    }

    fn builtin(&self, cmd: &HostCommand) -> CommandOutput {
        let HostCommand::Argv(args) = cmd else {
            return CommandOutput::default();
        };
        let mut table = lock(&self.table);
        match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["pgrep", "-f", pattern] => {
                let pids: Vec<String> = table
                    .entries
                    .iter()
                    .filter(|e| e.running && e.command_line.contains(pattern))
                    .map(|e| e.pid.to_string())
                    .collect();
                if pids.is_empty() {
                    CommandOutput::new(1, "", "")
                } else {
                    CommandOutput::ok(pids.join("\n"))
                }
            }
            ["killall", name] => {
                let mut killed = 0;
                for entry in table.entries.iter_mut().filter(|e| e.running && e.name == *name) {
                    entry.running = false;
                    killed += 1;
                }
                if killed == 0 {
                    CommandOutput::new(1, "", format!("{name}: no process found"))
                } else {
                    CommandOutput::default()
                }
            }
            _ => CommandOutput::default(),
        }
    }
}

impl HostRunner for ScriptedRunner {
    fn run(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        let line = cmd.to_string();
        let scripted = {
            let mut script = lock(&self.script);
            script.commands.push(line.clone());
            if script.failing_runs.iter().any(|p| line.contains(p.as_str())) {
                return Err(OrchestratorError::command_failed(line, "scripted failure"));
            }
            script
                .rules
                .iter()
                .rev()
                .find(|(pattern, _)| line.contains(pattern.as_str()))
                .map(|(_, output)| output.clone())
        };
        Ok(scripted.unwrap_or_else(|| self.builtin(cmd)))
    }

    fn spawn(&self, spec: SpawnSpec) -> Result<Box<dyn ManagedProcess>> {
        let command_line = spec.command_line();
        let stubborn = {
            let mut script = lock(&self.script);
            script.spawned.push(SpawnRecord {
                command_line: command_line.clone(),
                env: spec.env.clone(),
                current_dir: spec.current_dir.clone(),
            });
            if script.failing_spawns.iter().any(|p| command_line.contains(p.as_str())) {
                return Err(OrchestratorError::child_process(format!("{command_line}: scripted failure")));
            }
            script.stubborn_spawns.iter().any(|p| command_line.contains(p.as_str()))
        };

        let name = Path::new(&spec.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut table = lock(&self.table);
        table.next_pid += 1;
        let pid = 1000 + table.next_pid;
        table.entries.push(FakeEntry {
            pid,
            name,
            command_line,
            running: true,
            terminated: false,
            stubborn,
        });
        Ok(Box::new(FakeProcess {
            pid,
            table: Arc::clone(&self.table),
        }))
    }
}

#[derive(Debug)]
struct FakeProcess {
    pid: u32,
    table: Arc<Mutex<ProcessTable>>,
}

impl ManagedProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        lock(&self.table)
            .entries
            .iter()
            .any(|e| e.pid == self.pid && e.running)
    }

    fn terminate(&mut self) -> Result<()> {
        let mut table = lock(&self.table);
        if let Some(entry) = table.entries.iter_mut().find(|e| e.pid == self.pid && e.running) {
            if entry.stubborn {
                return Err(OrchestratorError::child_process(format!("pid {} ignored SIGTERM", self.pid)));
            }
            entry.running = false;
            entry.terminated = true;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FirewallLog {
    applied: Vec<(FirewallRule, RuleOp)>,
    active: Vec<FirewallRule>,
    failing: Vec<FirewallRule>,
    failing_removals: Vec<FirewallRule>,
}

/// [`Firewall`] keeping rules in memory.
#[derive(Debug, Default)]
pub(crate) struct RecordingFirewall {
    log: Mutex<FirewallLog>,
}

impl RecordingFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes adding `rule` fail.
    pub fn fail_on(&self, rule: FirewallRule) {
        lock(&self.log).failing.push(rule);
    }

    /// Makes removing `rule` fail.
    pub fn fail_removal_of(&self, rule: FirewallRule) {
        lock(&self.log).failing_removals.push(rule);
    }

    /// Rules successfully applied with `op`, in order.
    pub fn applied(&self, op: RuleOp) -> Vec<FirewallRule> {
        lock(&self.log)
            .applied
            .iter()
            .filter(|(_, o)| *o == op)
            .map(|(rule, _)| rule.clone())
            .collect()
    }

    /// Rules currently installed.
    pub fn active(&self) -> Vec<FirewallRule> {
        lock(&self.log).active.clone()
    }
}

impl Firewall for RecordingFirewall {
    fn apply(&self, rule: &FirewallRule, op: RuleOp) -> Result<()> {
        let mut log = lock(&self.log);
        if op == RuleOp::Add && log.failing.contains(rule) {
            return Err(OrchestratorError::provisioning_failure(
                format!("firewall rule {rule}"),
                "iptables -I",
                "scripted failure",
            ));
        }
        if op == RuleOp::Remove && log.failing_removals.contains(rule) {
            return Err(OrchestratorError::command_failed("iptables -D", "scripted failure"));
        }
        log.applied.push((rule.clone(), op));
        match op {
            RuleOp::Add => {
                if !log.active.contains(rule) {
                    log.active.push(rule.clone());
                }
            }
            RuleOp::Remove => log.active.retain(|r| r != rule),
        }
        Ok(())
    }
}

/// [`PipePair`] made of two regular files in a temporary directory.
///
/// Clones share state, so a test can keep one and hand another to a link.
#[derive(Debug, Clone)]
pub(crate) struct FakePipePair {
    dir: Arc<TempDir>,
    open: Arc<AtomicBool>,
}

impl FakePipePair {
    pub fn new() -> Self {
        Self {
            dir: Arc::new(tempfile::tempdir().unwrap()),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn endpoints(&self) -> PipeEndpoints {
        PipeEndpoints {
            user: self.dir.path().join("pipe0"),
            radio: self.dir.path().join("pipe1"),
        }
    }
}

impl PipePair for FakePipePair {
    fn open(&mut self) -> Result<PipeEndpoints> {
        if self.open.load(Ordering::SeqCst) {
            return Err(OrchestratorError::invalid_state("fake pipe pair already open"));
        }
        let endpoints = self.endpoints();
        File::create(&endpoints.user)?;
        File::create(&endpoints.radio)?;
        self.open.store(true, Ordering::SeqCst);
        Ok(endpoints)
    }

    fn close(&mut self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let endpoints = self.endpoints();
            fs::remove_file(endpoints.user)?;
            fs::remove_file(endpoints.radio)?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
