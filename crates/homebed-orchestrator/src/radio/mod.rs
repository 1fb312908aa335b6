//! Virtual radio links.
//!
//! A [`VirtualRadioLink`] connects a simulated device to a radio emulator
//! process through a pipe pair. Every link gets a petition id from the shared
//! [`PetitionCounter`]; the emulator's ports are shifted by
//! `petition_id * port_group_size` so concurrent emulators never collide.

mod pipe;

pub use pipe::{PipeEndpoints, PipePair, PlaceholderPipePair, SocatPipePair};

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::config::RadioConfig;
use crate::context::HostContext;
use crate::error::{OrchestratorError, Result, TeardownReport};
use crate::executor::SerialExecutor;
use crate::host::{HostRunner, ManagedProcess, SpawnSpec};

/// Environment variable carrying the port offset to the emulator.
pub const PORT_OFFSET_ENV: &str = "PORT_OFFSET";

/// Process-wide source of petition ids.
///
/// Ids start at 1 and are never reused, so port ranges derived from them
/// are pairwise disjoint.
#[derive(Debug, Default)]
pub struct PetitionCounter {
    last: Mutex<u64>,
}

impl PetitionCounter {
    /// Creates a counter whose first id is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh petition id.
    pub fn next(&self) -> u64 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        *last += 1;
        *last
    }

    /// Returns the most recently issued id (0 if none).
    pub fn current(&self) -> u64 {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Which [`PipePair`] new radio links use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipeBackend {
    /// Linked PTYs created by socat.
    #[default]
    Socat,
    /// Unconnected placeholder files, for dry runs.
    Placeholder,
}

/// Operating mode of the radio emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    /// Radio co-processor: the device runs the network stack.
    Rcp,
    /// Network co-processor, full Thread device.
    NcpFtd,
}

impl RadioMode {
    /// Picks the mode from the per-device RCP flag.
    pub fn from_rcp_flag(rcp: bool) -> Self {
        if rcp {
            RadioMode::Rcp
        } else {
            RadioMode::NcpFtd
        }
    }

    /// Returns the emulator binary for this mode.
    pub fn binary<'a>(&self, config: &'a RadioConfig) -> &'a str {
        match self {
            RadioMode::Rcp => &config.rcp_binary,
            RadioMode::NcpFtd => &config.ncp_binary,
        }
    }
}

impl fmt::Display for RadioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioMode::Rcp => f.write_str("rcp"),
            RadioMode::NcpFtd => f.write_str("ncp-ftd"),
        }
    }
}

/// A pipe pair plus the radio emulator bound to its far end.
pub struct VirtualRadioLink {
    device_id: String,
    petition_id: u64,
    mode: RadioMode,
    config: RadioConfig,
    executor: Arc<SerialExecutor>,
    runner: Arc<dyn HostRunner>,
    pipe: Option<Box<dyn PipePair>>,
    endpoints: Option<PipeEndpoints>,
    radio_fd: Option<File>,
    process: Option<Box<dyn ManagedProcess>>,
    work_dir: Option<PathBuf>,
}

impl VirtualRadioLink {
    /// Creates a closed link.
    ///
    /// Without an explicit `petition_id` the next id is drawn from the shared
    /// counter.
    pub fn new(ctx: &HostContext, device_id: impl Into<String>, petition_id: Option<u64>, mode: RadioMode) -> Self {
        let petition_id = petition_id.unwrap_or_else(|| ctx.resources.petitions.next());
        let config = ctx.config.radio.clone();
        let device_id = device_id.into();
        let pipe_base = config.work_dir.join(link_dir_name(&device_id, petition_id));
        let pipe: Box<dyn PipePair> = match ctx.pipes {
            PipeBackend::Socat => Box::new(SocatPipePair::new(Arc::clone(&ctx.runner), &config, pipe_base)),
            PipeBackend::Placeholder => Box::new(PlaceholderPipePair::new(pipe_base)),
        };

        Self {
            device_id,
            petition_id,
            mode,
            config,
            executor: Arc::clone(&ctx.executor),
            runner: Arc::clone(&ctx.runner),
            pipe: Some(pipe),
            endpoints: None,
            radio_fd: None,
            process: None,
            work_dir: None,
        }
    }

    /// Replaces the pipe pair implementation. Only valid before `open()`.
    pub fn with_pipe(mut self, pipe: Box<dyn PipePair>) -> Self {
        self.pipe = Some(pipe);
        self
    }

    /// Returns the device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the petition id.
    pub fn petition_id(&self) -> u64 {
        self.petition_id
    }

    /// Returns the emulator mode.
    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    /// Returns the port offset handed to the emulator.
    pub fn port_offset(&self) -> u64 {
        self.petition_id * self.config.port_group_size
    }

    /// Returns the device-side pipe endpoint while open.
    pub fn user_pipe(&self) -> Option<&Path> {
        self.endpoints.as_ref().map(|e| e.user.as_path())
    }

    /// Returns true while the emulator process is attached.
    pub fn is_open(&self) -> bool {
        self.process.is_some()
    }

    /// Opens the pipe pair and starts the emulator.
    ///
    /// On failure everything acquired so far is released again.
    pub fn open(&mut self) -> Result<&Path> {
        if self.process.is_some() {
            return Err(OrchestratorError::invalid_state(format!(
                "radio link for {} already open",
                self.device_id
            )));
        }
        if self.pipe.is_none() {
            return Err(OrchestratorError::invalid_state(format!(
                "radio link for {} was closed",
                self.device_id
            )));
        }

        if let Err(e) = self.start() {
            let report = self.close();
            if !report.is_clean() {
                debug!(device = %self.device_id, report = %report, "Rollback after failed open");
            }
            return Err(e);
        }

        self.user_pipe()
            .ok_or_else(|| OrchestratorError::invalid_state("radio link has no user endpoint"))
    }

    fn start(&mut self) -> Result<()> {
        let work_dir = self
            .config
            .work_dir
            .join(link_dir_name(&self.device_id, self.petition_id));
        fs::create_dir_all(&work_dir)?;
        self.work_dir = Some(work_dir.clone());

        let endpoints = match self.pipe.as_mut() {
            Some(pipe) => pipe.open()?,
            None => return Err(OrchestratorError::invalid_state("pipe pair missing")),
        };
        let radio_fd = OpenOptions::new().read(true).write(true).open(&endpoints.radio)?;
        self.endpoints = Some(endpoints);

        let mut spec = SpawnSpec::new(self.mode.binary(&self.config))
            .arg(self.device_id.clone())
            .env(PORT_OFFSET_ENV, self.port_offset().to_string())
            .stdio(radio_fd.try_clone()?)
            .current_dir(work_dir)
            .stop_grace(self.config.stop_grace());
        if let Some(path) = augmented_path(&self.config.extra_path)? {
            spec = spec.env("PATH", path);
        }
        self.radio_fd = Some(radio_fd);

        info!(
            device = %self.device_id,
            petition = self.petition_id,
            port_offset = self.port_offset(),
            mode = %self.mode,
            "Starting radio emulator"
        );
        let runner = Arc::clone(&self.runner);
        let process = self.executor.run(move || runner.spawn(spec))?;
        self.process = Some(process);
        Ok(())
    }

    /// Tears the link down.
    ///
    /// Releases the descriptor, the emulator process, the pipe pair and the
    /// working directory, in that order. Steps whose resource is already gone
    /// are skipped, so calling this repeatedly is safe.
    pub fn close(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();

        if let Some(fd) = self.radio_fd.take() {
            drop(fd);
        }
        if let Some(mut process) = self.process.take() {
            report.check("terminate radio emulator", process.terminate());
            info!(device = %self.device_id, "Radio emulator stopped");
        }
        if let Some(mut pipe) = self.pipe.take() {
            if pipe.is_open() {
                report.check("close pipe pair", pipe.close());
            }
        }
        self.endpoints = None;
        if let Some(dir) = self.work_dir.take() {
            if dir.exists() {
                report.check("remove radio work dir", fs::remove_dir_all(&dir));
            }
        }

        report
    }
}

impl fmt::Debug for VirtualRadioLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualRadioLink")
            .field("device_id", &self.device_id)
            .field("petition_id", &self.petition_id)
            .field("mode", &self.mode)
            .field("endpoints", &self.endpoints)
            .field("process", &self.process)
            .finish()
    }
}

impl Drop for VirtualRadioLink {
    fn drop(&mut self) {
        let report = self.close();
        if !report.is_clean() {
            debug!(device = %self.device_id, report = %report, "Radio link closed on drop");
        }
    }
}

fn link_dir_name(device_id: &str, petition_id: u64) -> String {
    format!("{device_id}-{petition_id}")
}

/// `extra` prepended to the inherited `PATH`, or `None` when there is nothing to add.
fn augmented_path(extra: &[PathBuf]) -> Result<Option<String>> {
    if extra.is_empty() {
        return Ok(None);
    }
    let inherited = std::env::var_os("PATH").unwrap_or_default();
    let dirs = extra
        .iter()
        .cloned()
        .chain(std::env::split_paths(&inherited));
    let joined = std::env::join_paths(dirs)
        .map_err(|e| OrchestratorError::configuration(format!("radio.extra_path: {e}")))?;
    Ok(Some(joined.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;
    use crate::testing::{self, FakePipePair, ScriptedRunner};

    fn link(ctx: &HostContext, device: &str, mode: RadioMode) -> (VirtualRadioLink, FakePipePair) {
        let pipe = FakePipePair::new();
        let link = VirtualRadioLink::new(ctx, device, None, mode).with_pipe(Box::new(pipe.clone()));
        (link, pipe)
    }

    #[test]
    fn test_petition_counter_starts_at_one() {
        let counter = PetitionCounter::new();
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn test_concurrent_petitions_are_distinct() {
        let counter = PetitionCounter::new();
        let ids: Vec<u64> = thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| (0..50).map(|_| counter.next()).collect::<Vec<_>>()))
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });

        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 400);
        assert_eq!(counter.current(), 400);
    }

    #[test]
    fn test_concurrent_links_have_disjoint_ports() {
        let runner = Arc::new(ScriptedRunner::new());
        let (ctx, _dir) = testing::context(runner);

        let offsets: Vec<u64> = thread::scope(|s| {
            let workers: Vec<_> = (0..6)
                .map(|i| {
                    let ctx = ctx.clone();
                    s.spawn(move || {
                        VirtualRadioLink::new(&ctx, format!("dev{i}"), None, RadioMode::Rcp).port_offset()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let group = ctx.config.radio.port_group_size;
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            assert!(pair[1] - pair[0] >= group);
        }
    }

    #[test]
    fn test_mode_selects_binary() {
        let config = RadioConfig::default();
        assert_eq!(RadioMode::Rcp.binary(&config), "ot-rcp");
        assert_eq!(RadioMode::NcpFtd.binary(&config), "ot-ncp-ftd");
        assert_eq!(RadioMode::from_rcp_flag(true), RadioMode::Rcp);
        assert_eq!(RadioMode::from_rcp_flag(false), RadioMode::NcpFtd);
    }

    #[test]
    fn test_open_spawns_emulator() {
        let runner = Arc::new(ScriptedRunner::new());
        let (ctx, _dir) = testing::context(runner.clone());

        let (mut link, pipe) = link(&ctx, "lock", RadioMode::NcpFtd);
        let petition = link.petition_id();
        let user = link.open().unwrap().to_path_buf();
        assert_eq!(user, pipe.endpoints().user);
        assert!(link.is_open());

        let spawned = runner.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].command_line, "ot-ncp-ftd lock");
        assert_eq!(
            spawned[0].env.get(PORT_OFFSET_ENV),
            Some(&(petition * 34).to_string())
        );
        let work_dir = spawned[0].current_dir.clone().unwrap();
        assert!(work_dir.exists());

        assert!(link.open().is_err());

        let report = link.close();
        assert!(report.is_clean(), "{report}");
        assert_eq!(runner.running_count(), 0);
        assert!(!pipe.is_open());
        assert!(!work_dir.exists());
    }

    #[test]
    fn test_explicit_petition_id() {
        let runner = Arc::new(ScriptedRunner::new());
        let (ctx, _dir) = testing::context(runner);

        let link = VirtualRadioLink::new(&ctx, "bulb", Some(3), RadioMode::Rcp);
        assert_eq!(link.petition_id(), 3);
        assert_eq!(link.port_offset(), 102);
        // The shared counter is untouched.
        assert_eq!(ctx.resources.petitions.current(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let runner = Arc::new(ScriptedRunner::new());
        let (ctx, _dir) = testing::context(runner.clone());

        let (mut link, _pipe) = link(&ctx, "lock", RadioMode::Rcp);
        link.open().unwrap();
        assert!(link.close().is_clean());
        assert!(link.close().is_clean());
        assert_eq!(runner.terminated_count(), 1);

        // A closed link cannot be reopened.
        assert!(matches!(link.open(), Err(OrchestratorError::InvalidState(_))));
    }

    #[test]
    fn test_close_continues_after_failed_terminate() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.stubborn_spawns_of("ot-rcp");
        let (ctx, _dir) = testing::context(runner.clone());

        let (mut link, pipe) = link(&ctx, "lock", RadioMode::Rcp);
        link.open().unwrap();
        let work_dir = runner.spawned()[0].current_dir.clone().unwrap();

        let report = link.close();
        assert!(!report.is_clean());
        assert_eq!(report.issues().len(), 1);
        assert_eq!(report.issues()[0].step, "terminate radio emulator");
        // Steps after the failed one still ran.
        assert!(!pipe.is_open());
        assert!(!work_dir.exists());
        assert!(!link.is_open());
        assert!(link.close().is_clean());
    }

    #[test]
    fn test_close_without_open() {
        let runner = Arc::new(ScriptedRunner::new());
        let (ctx, _dir) = testing::context(runner.clone());

        let (mut link, pipe) = link(&ctx, "lock", RadioMode::Rcp);
        assert!(link.close().is_clean());
        assert!(!pipe.is_open());
        assert!(runner.spawned().is_empty());
    }

    #[test]
    fn test_failed_spawn_rolls_back() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_spawns_of("ot-rcp");
        let (ctx, _dir) = testing::context(runner.clone());

        let (mut link, pipe) = link(&ctx, "lock", RadioMode::Rcp);
        let err = link.open().unwrap_err();
        assert!(matches!(err, OrchestratorError::ChildProcessFailure(_)));
        assert!(!pipe.is_open());
        assert!(!link.is_open());
        assert!(link.user_pipe().is_none());
    }

    #[test]
    fn test_extra_path_is_prepended() {
        let path = augmented_path(&[PathBuf::from("/opt/ot/bin")]).unwrap().unwrap();
        assert!(path.starts_with("/opt/ot/bin"));
        assert!(augmented_path(&[]).unwrap().is_none());
    }
}
