//! Bidirectional pipe pairs between a device and its radio emulator.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RadioConfig;
use crate::error::{OrchestratorError, Result};
use crate::host::{HostRunner, ManagedProcess, SpawnSpec};

const LINK_POLL_INTERVAL: Duration = Duration::from_millis(20);

static PAIR_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// The two ends of an open pipe pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeEndpoints {
    /// Handed to the device under test.
    pub user: PathBuf,
    /// Bound to the radio emulator's stdin/stdout.
    pub radio: PathBuf,
}

/// Creates and removes a pair of connected path endpoints.
pub trait PipePair: Send + fmt::Debug {
    /// Creates both endpoints. Fails if the pair is already open.
    fn open(&mut self) -> Result<PipeEndpoints>;

    /// Removes both endpoints. Closing a closed pair is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Returns true between a successful `open()` and `close()`.
    fn is_open(&self) -> bool;
}

/// [`PipePair`] backed by two PTYs linked together by `socat`.
///
/// The links live at `<dir>/pipe0` (user side) and `<dir>/pipe1` (radio side),
/// where `<dir>` is a fresh directory under the configured base.
pub struct SocatPipePair {
    runner: Arc<dyn HostRunner>,
    socat: String,
    base_dir: PathBuf,
    timeout: Duration,
    stop_grace: Duration,
    dir: Option<PathBuf>,
    process: Option<Box<dyn ManagedProcess>>,
}

impl SocatPipePair {
    /// Creates a closed pair placing its links under `base_dir`.
    pub fn new(runner: Arc<dyn HostRunner>, config: &RadioConfig, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            socat: config.socat.clone(),
            base_dir: base_dir.into(),
            timeout: config.pipe_timeout(),
            stop_grace: config.stop_grace(),
            dir: None,
            process: None,
        }
    }

    fn wait_for_links(&self, endpoints: &PipeEndpoints) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            if endpoints.user.exists() && endpoints.radio.exists() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(LINK_POLL_INTERVAL);
        }
    }

    fn link_arg(path: &Path) -> String {
        format!("pty,raw,echo=0,link={}", path.display())
    }
}

impl fmt::Debug for SocatPipePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocatPipePair")
            .field("socat", &self.socat)
            .field("dir", &self.dir)
            .field("process", &self.process)
            .finish()
    }
}

impl PipePair for SocatPipePair {
    fn open(&mut self) -> Result<PipeEndpoints> {
        if self.is_open() {
            return Err(OrchestratorError::invalid_state("pipe pair already open"));
        }

        let dir = unique_dir(&self.base_dir);
        fs::create_dir_all(&dir)?;
        let endpoints = PipeEndpoints {
            user: dir.join("pipe0"),
            radio: dir.join("pipe1"),
        };

        let spec = SpawnSpec::new(self.socat.clone())
            .args(["-d", "-d"])
            .arg(Self::link_arg(&endpoints.user))
            .arg(Self::link_arg(&endpoints.radio))
            .stop_grace(self.stop_grace);
        let mut process = match self.runner.spawn(spec) {
            Ok(process) => process,
            Err(e) => {
                remove_pair_dir(&dir);
                return Err(e);
            }
        };

        if !self.wait_for_links(&endpoints) {
            if let Err(e) = process.terminate() {
                warn!(error = %e, "Failed to stop socat after link timeout");
            }
            remove_pair_dir(&dir);
            return Err(OrchestratorError::child_process(format!(
                "socat did not create {} within {:?}",
                dir.display(),
                self.timeout
            )));
        }

        info!(user = %endpoints.user.display(), radio = %endpoints.radio.display(), "Pipe pair open");
        self.dir = Some(dir);
        self.process = Some(process);
        Ok(endpoints)
    }

    fn close(&mut self) -> Result<()> {
        let mut first_error = None;

        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.terminate() {
                first_error = Some(e);
            }
        }
        if let Some(dir) = self.dir.take() {
            debug!(dir = %dir.display(), "Removing pipe pair directory");
            if let Err(e) = fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound && first_error.is_none() {
                    first_error = Some(e.into());
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.dir.is_some()
    }
}

/// Removes a pair directory on a failure path, logging what cannot be removed.
fn remove_pair_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove pipe pair directory");
        }
    }
}

fn unique_dir(base: &Path) -> PathBuf {
    let seq = PAIR_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    base.join(format!("pipes-{}-{seq}", std::process::id()))
}

/// [`PipePair`] made of two empty regular files, for dry runs.
///
/// Nothing is connected: the radio emulator is never started either, but the
/// endpoints exist and can be opened like real ones.
#[derive(Debug)]
pub struct PlaceholderPipePair {
    base_dir: PathBuf,
    dir: Option<PathBuf>,
}

impl PlaceholderPipePair {
    /// Creates a closed pair placing its files under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            dir: None,
        }
    }
}

impl PipePair for PlaceholderPipePair {
    fn open(&mut self) -> Result<PipeEndpoints> {
        if self.is_open() {
            return Err(OrchestratorError::invalid_state("pipe pair already open"));
        }
        let dir = unique_dir(&self.base_dir);
        fs::create_dir_all(&dir)?;
        let endpoints = PipeEndpoints {
            user: dir.join("pipe0"),
            radio: dir.join("pipe1"),
        };
        if let Err(e) = fs::File::create(&endpoints.user).and_then(|_| fs::File::create(&endpoints.radio)) {
            remove_pair_dir(&dir);
            return Err(e.into());
        }
        info!(user = %endpoints.user.display(), "Placeholder pipe pair open");
        self.dir = Some(dir);
        Ok(endpoints)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.dir.is_some()
    }
}

impl Drop for PlaceholderPipePair {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close placeholder pipe pair on drop");
        }
    }
}

impl Drop for SocatPipePair {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!(error = %e, "Failed to close pipe pair on drop");
            }
        }
    }
}
