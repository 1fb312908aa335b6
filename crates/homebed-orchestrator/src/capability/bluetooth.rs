//! Virtual BLE adapters.
//!
//! Two shared daemons back every Bluetooth device: `bluetoothd` and
//! `btvirt`, the latter creating a fixed number of virtual adapters. Each
//! device leases one adapter from the [`AdapterPool`]; the device releasing
//! the last lease also stops the daemons.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{ContainerHints, ResourceCapability};
use crate::config::BluetoothConfig;
use crate::context::HostContext;
use crate::error::{OrchestratorError, Result, TeardownReport};
use crate::host::{HostCommand, HostRunner, ManagedProcess, ProcessCommand, SpawnSpec};

/// Environment variable naming the leased adapter inside the device.
pub const BLE_ADAPTER_ENV: &str = "BLE_ADAPT";

const HOST_NETWORK_MODE: &str = "host";

/// Adapters currently leased to devices, plus the daemons serving them.
///
/// An adapter id appears at most once. The pool is empty exactly when no
/// Bluetooth device is active.
#[derive(Debug, Default)]
pub struct AdapterPool {
    state: Mutex<PoolState>,
    active: AtomicUsize,
}

#[derive(Debug, Default)]
struct PoolState {
    leased: Vec<String>,
    daemons: Vec<Box<dyn ManagedProcess>>,
    daemons_up: bool,
}

impl AdapterPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of active leases.
    pub fn len(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Returns true when no adapter is leased.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the leased adapter ids, in lease order.
    pub fn leased(&self) -> Vec<String> {
        self.lock().leased.clone()
    }

    /// Returns true if `adapter` is currently leased.
    pub fn contains(&self, adapter: &str) -> bool {
        self.lock().leased.iter().any(|a| a == adapter)
    }

    /// Returns true between a successful daemon start and the final release.
    pub fn daemons_running(&self) -> bool {
        self.lock().daemons_up
    }
}

/// One supervised daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSpec {
    /// Process name, as matched by `killall`.
    pub name: String,
    /// Full path of the executable, also the `pgrep -f` pattern.
    pub program: PathBuf,
    /// Launch arguments.
    pub args: Vec<String>,
}

impl DaemonSpec {
    /// The BLE daemon.
    pub fn bluetoothd(config: &BluetoothConfig) -> Self {
        Self {
            name: "bluetoothd".to_string(),
            program: config.bluetoothd_path(),
            args: vec!["--experimental".to_string(), "--debug".to_string()],
        }
    }

    /// The virtual adapter daemon, creating `config.virtual_adapters` adapters.
    pub fn btvirt(config: &BluetoothConfig) -> Self {
        Self {
            name: "btvirt".to_string(),
            program: config.btvirt_path(),
            args: vec!["-L".to_string(), format!("-l{}", config.virtual_adapters)],
        }
    }

    fn program_str(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    fn is_running(&self, runner: &dyn HostRunner) -> Result<bool> {
        Ok(runner.run(&ProcessCommand::pgrep_full(&self.program_str()))?.success())
    }
}

#[derive(Debug, Clone, Copy)]
struct DaemonTiming {
    settle: Duration,
    grace: Duration,
    retries: u32,
    interval: Duration,
}

impl From<&BluetoothConfig> for DaemonTiming {
    fn from(config: &BluetoothConfig) -> Self {
        Self {
            settle: config.settle_delay(),
            grace: config.startup_grace(),
            retries: config.probe_retries,
            interval: config.probe_interval(),
        }
    }
}

/// Makes sure `spec` is running, relaunching it if not.
///
/// Returns the handle of a freshly launched daemon, or `None` when one was
/// already up.
fn ensure_running(
    runner: &dyn HostRunner,
    spec: &DaemonSpec,
    timing: DaemonTiming,
) -> Result<Option<Box<dyn ManagedProcess>>> {
    if spec.is_running(runner)? {
        debug!(daemon = %spec.name, "Daemon already running");
        return Ok(None);
    }

    // Anything left with that name belongs to nobody we know about.
    info!(daemon = %spec.name, "Killing stale daemon instances");
    let out = runner.run(&ProcessCommand::killall(&spec.name))?;
    if !out.success() {
        debug!(daemon = %spec.name, "No stale instances");
    }
    thread::sleep(timing.settle);

    let launch = SpawnSpec::new(spec.program_str()).args(spec.args.iter().cloned());
    info!(daemon = %spec.name, command = %launch.command_line(), "Bringing up daemon");
    let mut process = runner
        .spawn(launch)
        .map_err(|e| OrchestratorError::daemon_start_failure(&spec.name, e.to_string()))?;
    thread::sleep(timing.grace);

    let attempts = timing.retries.max(1);
    for attempt in 1..=attempts {
        if spec.is_running(runner)? {
            info!(daemon = %spec.name, pid = process.id(), "Daemon up");
            return Ok(Some(process));
        }
        debug!(daemon = %spec.name, attempt, "Daemon not up yet");
        if attempt < attempts {
            thread::sleep(timing.interval);
        }
    }

    if let Err(e) = process.terminate() {
        warn!(daemon = %spec.name, error = %e, "Failed to reap daemon that never came up");
    }
    Err(OrchestratorError::daemon_start_failure(
        &spec.name,
        format!("not running after {attempts} probes"),
    ))
}

/// Extracts the ids of virtual adapters from `hciconfig` output, naturally sorted.
///
/// Adapter header lines are not indented and carry the bus type, e.g.
/// `hci1:\tType: Primary  Bus: Virtual`.
pub fn parse_virtual_adapters(output: &str) -> Vec<String> {
    let mut ids: Vec<String> = output
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter(|line| line.contains("Bus: Virtual"))
        .filter_map(|line| line.split_whitespace().next())
        .map(|token| token.trim_end_matches(':').to_string())
        .filter(|id| !id.is_empty())
        .collect();
    natural_sort(&mut ids);
    ids
}

/// Sorts ids so that embedded numbers compare numerically (`hci2` < `hci10`).
pub fn natural_sort(ids: &mut [String]) {
    ids.sort_by(|a, b| natural_key(a).cmp(&natural_key(b)));
}

fn natural_key(id: &str) -> (&str, u64, &str) {
    let digits_at = id.find(|c: char| c.is_ascii_digit()).unwrap_or(id.len());
    let (prefix, rest) = id.split_at(digits_at);
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let (digits, suffix) = rest.split_at(digits_end);
    (prefix, digits.parse().unwrap_or(0), suffix)
}

fn query_adapters(runner: &dyn HostRunner, config: &BluetoothConfig) -> Result<Vec<String>> {
    let cmd = HostCommand::argv([config.hciconfig_path().to_string_lossy().into_owned()]);
    let out = runner.run(&cmd)?;
    if !out.success() {
        return Err(OrchestratorError::provisioning_failure(
            "virtual BLE adapters",
            cmd.to_string(),
            out.failure_reason(),
        ));
    }
    Ok(parse_virtual_adapters(&out.stdout))
}

/// A virtual BLE adapter leased to one device.
pub struct BluetoothCapability {
    ctx: HostContext,
    adapter: Option<String>,
}

impl BluetoothCapability {
    /// Starts the shared daemons if needed and leases a free adapter.
    ///
    /// Daemon failures yield [`OrchestratorError::DaemonStartFailure`]; an
    /// exhausted pool yields [`OrchestratorError::ResourceExhausted`].
    pub fn enable(ctx: &HostContext) -> Result<Self> {
        let pool = &ctx.resources.adapters;
        let mut state = pool.lock();

        let adapter = match Self::lease(ctx, &mut state) {
            Ok(adapter) => adapter,
            Err(e) => {
                error!(error = %e, "Bluetooth acquisition failed");
                if state.leased.is_empty() && state.daemons_up {
                    let report = stop_daemons(ctx, &mut state);
                    if !report.is_clean() {
                        warn!(report = %report, "Daemon cleanup after failed acquisition");
                    }
                }
                return Err(e);
            }
        };

        let active = pool.active.fetch_add(1, Ordering::AcqRel) + 1;
        info!(adapter = %adapter, active, "Leased virtual BLE adapter");
        Ok(Self {
            ctx: ctx.clone(),
            adapter: Some(adapter),
        })
    }

    fn lease(ctx: &HostContext, state: &mut PoolState) -> Result<String> {
        let config = &ctx.config.bluetooth;
        let daemons = [DaemonSpec::bluetoothd(config), DaemonSpec::btvirt(config)];
        let timing = DaemonTiming::from(config);
        let runner = Arc::clone(&ctx.runner);

        let started = ctx.executor.run(move || {
            let mut started: Vec<Box<dyn ManagedProcess>> = Vec::new();
            for daemon in &daemons {
                match ensure_running(runner.as_ref(), daemon, timing) {
                    Ok(Some(process)) => started.push(process),
                    Ok(None) => {}
                    Err(e) => {
                        // Reap what this attempt launched before giving up.
                        for mut process in started {
                            if let Err(te) = process.terminate() {
                                warn!(pid = process.id(), error = %te, "Failed to stop daemon after failed start");
                            }
                        }
                        return Err(e);
                    }
                }
            }
            Ok(started)
        });
        match started {
            Ok(started) => {
                state.daemons.extend(started);
                state.daemons_up = true;
            }
            Err(e) => {
                // bluetoothd may be up even though btvirt failed.
                state.daemons_up = true;
                return Err(e);
            }
        }

        let available = query_adapters(ctx.runner.as_ref(), config)?;
        let free = available
            .into_iter()
            .find(|id| !state.leased.contains(id))
            .ok_or_else(|| {
                OrchestratorError::resource_exhausted(
                    "virtual BLE adapter",
                    format!("all {} adapters leased", state.leased.len()),
                )
            })?;
        state.leased.push(free.clone());
        Ok(free)
    }

    /// Returns the leased adapter id while enabled.
    pub fn adapter(&self) -> Option<&str> {
        self.adapter.as_deref()
    }
}

fn stop_daemons(ctx: &HostContext, state: &mut PoolState) -> TeardownReport {
    info!("Stopping Bluetooth daemons");
    let handles: Vec<Box<dyn ManagedProcess>> = state.daemons.drain(..).collect();
    let config = &ctx.config.bluetooth;
    let names = [DaemonSpec::btvirt(config).name, DaemonSpec::bluetoothd(config).name];
    let runner = Arc::clone(&ctx.runner);

    let stopped = ctx.executor.run_or_inline(move || {
        let mut report = TeardownReport::new();
        for mut daemon in handles {
            report.check("terminate bluetooth daemon", daemon.terminate());
        }
        for name in &names {
            match runner.run(&ProcessCommand::killall(name)) {
                Ok(out) if !out.success() => debug!(daemon = %name, "No instances left to kill"),
                Ok(_) => {}
                Err(e) => report.record(format!("killall {name}"), e),
            }
        }
        Ok(report)
    });

    state.daemons_up = false;
    stopped.unwrap_or_else(|e| {
        let mut report = TeardownReport::new();
        report.record("stop bluetooth daemons", e);
        report
    })
}

impl ResourceCapability for BluetoothCapability {
    fn name(&self) -> &'static str {
        "Bluetooth"
    }

    fn container_hints(&self) -> ContainerHints {
        let dbus = self.ctx.config.bluetooth.dbus_socket_dir.display().to_string();
        let mut hints = ContainerHints::new()
            .volume(format!("{dbus}:{dbus}"))
            .network_mode(HOST_NETWORK_MODE);
        if let Some(adapter) = &self.adapter {
            hints = hints.env(BLE_ADAPTER_ENV, adapter.clone());
        }
        hints
    }

    fn disable(&mut self) -> TeardownReport {
        let Some(adapter) = self.adapter.take() else {
            return TeardownReport::new();
        };

        let pool = &self.ctx.resources.adapters;
        let mut state = pool.lock();
        let Some(index) = state.leased.iter().position(|a| *a == adapter) else {
            let mut report = TeardownReport::new();
            report.record("release adapter", format!("{adapter} was not leased"));
            return report;
        };
        state.leased.remove(index);

        let remaining = pool.active.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert_eq!(remaining, state.leased.len());
        info!(adapter = %adapter, remaining, "Released virtual BLE adapter");

        if remaining == 0 {
            stop_daemons(&self.ctx, &mut state)
        } else {
            TeardownReport::new()
        }
    }
}

impl fmt::Debug for BluetoothCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluetoothCapability")
            .field("adapter", &self.adapter)
            .finish()
    }
}

impl Drop for BluetoothCapability {
    fn drop(&mut self) {
        let report = self.disable();
        if !report.is_clean() {
            warn!(report = %report, "Bluetooth capability released on drop");
        }
    }
}
