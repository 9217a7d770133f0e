// packages/simlink/src/orchestrator/process_manager.rs
//! Process manager for the simulation engine subprocess
//!
//! Resolves the engine program, spawns it with the region path in its
//! environment and tears it down: grace period, SIGTERM, grace period, SIGKILL.

use crate::utils::errors::{Result, SimlinkError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Environment variable carrying the region path to the engine
pub const SHM_PATH_ENV: &str = "SIMLINK_SHM_PATH";

const EXIT_POLL: Duration = Duration::from_millis(10);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);
const DROP_REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for spawning the engine
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    /// Program path or name looked up in PATH
    pub program: String,

    /// Full argument list
    pub args: Vec<String>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,

    /// Pipe stdout back to the caller instead of discarding it
    pub capture_stdout: bool,
}

/// How the engine process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    /// Exit code, absent when killed by a signal
    pub code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// Whether shutdown had to send a signal
    pub forced: bool,
}

impl ExitReport {
    pub fn from_status(status: ExitStatus, forced: bool) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
            forced,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Process manager for the engine subprocess
pub struct ProcessManager {
    /// Resolved executables (cached)
    executable_paths: HashMap<String, PathBuf>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            executable_paths: HashMap::new(),
        }
    }

    /// Resolve `program` to an executable path
    pub fn resolve_program(&mut self, program: &str) -> Result<PathBuf> {
        if let Some(path) = self.executable_paths.get(program) {
            return Ok(path.clone());
        }

        let path = if program.contains(std::path::MAIN_SEPARATOR) {
            let path = Path::new(program);
            if !path.is_file() {
                return Err(SimlinkError::ProcessSpawnFailed(format!(
                    "Executable '{}' does not exist",
                    program
                )));
            }
            path.to_path_buf()
        } else {
            which::which(program).map_err(|e| {
                SimlinkError::ProcessSpawnFailed(format!(
                    "Executable '{}' not found in PATH: {}",
                    program, e
                ))
            })?
        };

        info!("Found {} at {:?}", program, path);
        self.executable_paths
            .insert(program.to_string(), path.clone());
        Ok(path)
    }

    /// Spawn the engine process
    pub async fn spawn(&mut self, config: &SpawnConfig) -> Result<Child> {
        let executable = self.resolve_program(&config.program)?;

        debug!("Spawning engine {:?} {:?}", executable, config.args);

        let mut command = Command::new(&executable);
        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        let stdout = if config.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        command
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            SimlinkError::ProcessSpawnFailed(format!(
                "Failed to spawn {:?}: {}",
                executable, e
            ))
        })?;

        info!("Engine spawned with PID: {:?}", child.id());
        Ok(child)
    }

    /// Wait up to `timeout` for `child` to exit on its own
    pub async fn wait_for_exit(
        &self,
        child: &Mutex<Child>,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>> {
        let started = Instant::now();
        loop {
            let status = child
                .lock()
                .try_wait()
                .map_err(|e| SimlinkError::RuntimeError(format!("Failed to poll engine: {}", e)))?;
            if status.is_some() {
                return Ok(status);
            }
            if started.elapsed() >= timeout {
                return Ok(None);
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    /// Reap `child`, escalating to SIGTERM and then SIGKILL after `grace`
    pub async fn shutdown(&self, child: &Mutex<Child>, grace: Duration) -> Result<ExitReport> {
        if let Some(status) = self.wait_for_exit(child, grace).await? {
            debug!("Engine exited on its own: {}", status);
            return Ok(ExitReport::from_status(status, false));
        }

        let pid = child.lock().id();
        if let Some(pid) = pid {
            warn!("Engine still running after {:?}, sending SIGTERM to PID {}", grace, pid);
            self.terminate(pid)?;
            if let Some(status) = self.wait_for_exit(child, grace).await? {
                return Ok(ExitReport::from_status(status, true));
            }
            warn!("Engine ignored SIGTERM, sending SIGKILL to PID {}", pid);
        }

        child
            .lock()
            .start_kill()
            .map_err(|e| SimlinkError::RuntimeError(format!("Failed to send SIGKILL: {}", e)))?;

        match self.wait_for_exit(child, KILL_TIMEOUT).await? {
            Some(status) => Ok(ExitReport::from_status(status, true)),
            None => Err(SimlinkError::RuntimeError(format!(
                "Engine did not exit within {:?} of SIGKILL",
                KILL_TIMEOUT
            ))),
        }
    }

    /// SIGKILL `child` and reap it without a runtime, giving up after a short bound
    pub fn kill_blocking(&self, child: &Mutex<Child>) -> Option<ExitStatus> {
        let mut child = child.lock();
        if let Err(e) = child.start_kill() {
            debug!("SIGKILL: {}", e);
        }

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if started.elapsed() < DROP_REAP_TIMEOUT => std::thread::sleep(EXIT_POLL),
                Ok(None) => {
                    warn!("Engine not reaped within {:?} of SIGKILL", DROP_REAP_TIMEOUT);
                    return None;
                }
                Err(e) => {
                    warn!("Failed to reap engine: {}", e);
                    return None;
                }
            }
        }
    }

    /// Send SIGTERM to a process by PID
    pub fn terminate(&self, pid: u32) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(pid as i32);
        debug!("Sending SIGTERM to PID {}", pid);
        kill(pid, Signal::SIGTERM)
            .map_err(|e| SimlinkError::RuntimeError(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Check if a process is running
    pub fn is_running(&self, pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let pid = Pid::from_raw(pid as i32);
        kill(pid, None).is_ok()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
