// packages/simlink/src/orchestrator/experiment.rs
//! One experiment: the engine subprocess plus the attached channel
//!
//! [`Experiment::launch`] spawns the engine, attaches the agent side of the
//! channel and answers the engine's init request; [`Experiment::shutdown`] detaches, reaps the engine and removes
//! the region file. Dropping an experiment that was never shut down kills the
//! engine and removes the file.

use crate::channel::slot::{PeerProbe, WaitPolicy};
use crate::interface::message_interface::MessageInterface;
use crate::orchestrator::process_manager::{ExitReport, ProcessManager, SpawnConfig, SHM_PATH_ENV};
use crate::utils::config::SimlinkConfig;
use crate::utils::errors::{ProtocolViolation, Result, SimlinkError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Reports the engine dead once it has exited
struct ChildProbe {
    child: Arc<Mutex<Child>>,
}

impl PeerProbe for ChildProbe {
    fn is_alive(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    fn describe(&self) -> String {
        match self.child.lock().try_wait() {
            Ok(Some(status)) => format!("simulation engine exited ({})", status),
            _ => "simulation engine exited".to_string(),
        }
    }
}

/// Scoped engine subprocess and channel handle
pub struct Experiment {
    run_id: Ulid,
    shm_path: PathBuf,
    manager: ProcessManager,
    child: Arc<Mutex<Child>>,
    interface: Option<MessageInterface>,
    output: Option<JoinHandle<()>>,
    grace: Duration,
    closed: bool,
}

impl Experiment {
    /// Spawn the engine and attach to the region it exposes
    pub async fn launch(config: &SimlinkConfig) -> Result<Self> {
        Self::launch_with_output(config, tokio::io::stdout()).await
    }

    /// [`launch`](Self::launch) with the engine's stdout forwarded to `sink`
    /// when `show_output` is set
    pub async fn launch_with_output<W>(config: &SimlinkConfig, sink: W) -> Result<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let run_id = Ulid::new();
        let shm_dir = &config.channel.shm_dir;
        std::fs::create_dir_all(shm_dir).map_err(|e| {
            SimlinkError::ChannelIo(format!("Failed to create {:?}: {}", shm_dir, e))
        })?;
        let shm_path = shm_dir.join(format!("simlink-{}.shm", run_id));

        let mut args = config.engine.args.clone();
        args.extend(config.engine.settings.to_args());
        let spawn = SpawnConfig {
            program: config.engine.program.clone(),
            args,
            work_dir: config.engine.work_dir.clone(),
            env_vars: vec![(
                SHM_PATH_ENV.to_string(),
                shm_path.to_string_lossy().into_owned(),
            )],
            capture_stdout: config.engine.show_output,
        };

        let mut manager = ProcessManager::new();
        let mut child = manager.spawn(&spawn).await?;
        let output = child
            .stdout
            .take()
            .map(|stdout| forward_output(stdout, sink));

        info!("Launched experiment {} with region {:?}", run_id, shm_path);

        let child = Arc::new(Mutex::new(child));
        let mut experiment = Self {
            run_id,
            shm_path,
            manager,
            child: Arc::clone(&child),
            interface: None,
            output,
            grace: config.engine.shutdown_grace(),
            closed: false,
        };

        let wait = WaitPolicy {
            timeout: config.channel.peer_timeout(),
            poll_interval: config.channel.poll_interval(),
            liveness_interval: config.channel.liveness_interval(),
            probe: Some(Arc::new(ChildProbe { child })),
        };
        let attach_timeout = config.channel.attach_timeout();
        let handshake = config.channel.init_handshake;
        let manager_id = config.container.manager_id;
        let path = experiment.shm_path.clone();

        let attached = tokio::task::spawn_blocking(move || {
            let mut interface = MessageInterface::attach(path, wait, attach_timeout)?;
            if handshake {
                interface.register(manager_id)?;
            }
            Ok::<_, SimlinkError>(interface)
        })
        .await
        .map_err(|e| SimlinkError::RuntimeError(format!("Attach task failed: {}", e)));

        match attached {
            Ok(Ok(interface)) => {
                experiment.interface = Some(interface);
                Ok(experiment)
            }
            Ok(Err(e)) | Err(e) => {
                error!("Experiment {} failed to attach: {}", run_id, e);
                if let Err(cleanup) = experiment.shutdown().await {
                    warn!("Cleanup after failed attach: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    /// The attached agent-side interface
    pub fn interface_mut(&mut self) -> Result<&mut MessageInterface> {
        self.interface
            .as_mut()
            .ok_or_else(|| ProtocolViolation::Detached.into())
    }

    pub fn run_id(&self) -> Ulid {
        self.run_id
    }

    pub fn shm_path(&self) -> &Path {
        &self.shm_path
    }

    /// PID of the engine while it has not been reaped
    pub fn engine_pid(&self) -> Option<u32> {
        self.child.lock().id()
    }

    /// Detach, reap the engine and remove the region file
    pub async fn shutdown(mut self) -> Result<ExitReport> {
        self.closed = true;

        if let Some(mut interface) = self.interface.take() {
            if let Err(e) = interface.detach() {
                warn!("Detach during shutdown: {}", e);
            }
        }

        let report = self.manager.shutdown(&self.child, self.grace).await;

        if let Some(output) = self.output.take() {
            if let Err(e) = output.await {
                warn!("Output forwarding task failed: {}", e);
            }
        }
        remove_region_file(&self.shm_path);

        let report = report?;
        info!(
            "Experiment {} engine exited (code {:?}, signal {:?}, forced {})",
            self.run_id, report.code, report.signal, report.forced
        );
        Ok(report)
    }
}

impl Drop for Experiment {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!("Experiment {} dropped without shutdown, killing engine", self.run_id);
        self.interface.take();
        if let Some(status) = self.manager.kill_blocking(&self.child) {
            debug!("Engine reaped on drop: {}", status);
        }
        if let Some(output) = self.output.take() {
            output.abort();
        }
        remove_region_file(&self.shm_path);
    }
}

/// Stream the engine's stdout into `sink` line by line
///
/// The pipe keeps being drained after the sink fails so the engine never
/// blocks on a full pipe.
fn forward_output<W>(stdout: ChildStdout, mut sink: W) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut forwarding = true;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if forwarding {
                        if let Err(e) = write_line(&mut sink, &line).await {
                            warn!("Failed to forward engine output: {}", e);
                            forwarding = false;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read engine output: {}", e);
                    break;
                }
            }
        }
    })
}

async fn write_line<W: AsyncWrite + Unpin>(sink: &mut W, line: &str) -> std::io::Result<()> {
    sink.write_all(line.as_bytes()).await?;
    sink.write_all(b"\n").await?;
    sink.flush().await
}

fn remove_region_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed leftover region {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove region {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::ErrorKind;

    fn config(program: &str, args: &[&str]) -> SimlinkConfig {
        let dir = std::env::temp_dir();
        let mut config = SimlinkConfig::default();
        config.engine.program = program.to_string();
        config.engine.args = args.iter().map(|a| a.to_string()).collect();
        config.engine.shutdown_grace_ms = 200;
        config.channel.shm_dir = dir;
        config.channel.attach_timeout_ms = 2_000;
        config
    }

    #[tokio::test]
    async fn test_missing_program_fails_before_attach() {
        let err = Experiment::launch(&config("simlink-no-such-engine", &[]))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Launch);
        assert!(matches!(err, SimlinkError::ProcessSpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_engine_exit_before_region_fails_attach() {
        let err = Experiment::launch(&config("sh", &["-c", "exit 3"]))
            .await
            .err()
            .unwrap();
        match err {
            SimlinkError::AttachFailed(reason) => assert!(reason.contains("exited")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_silent_engine_times_out_and_is_killed() {
        let mut config = config("sh", &["-c", "sleep 30"]);
        config.channel.attach_timeout_ms = 100;

        let err = Experiment::launch(&config).await.err().unwrap();
        assert!(matches!(err, SimlinkError::AttachFailed(_)));
    }

    #[tokio::test]
    async fn test_drop_without_shutdown_reaps_engine() {
        let mut manager = ProcessManager::new();
        let spawn = SpawnConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            ..Default::default()
        };
        let child = manager.spawn(&spawn).await.unwrap();
        let pid = child.id().unwrap();

        let run_id = Ulid::new();
        let shm_path = std::env::temp_dir().join(format!("simlink-{}.shm", run_id));
        std::fs::write(&shm_path, b"leftover").unwrap();

        let experiment = Experiment {
            run_id,
            shm_path: shm_path.clone(),
            manager,
            child: Arc::new(Mutex::new(child)),
            interface: None,
            output: None,
            grace: Duration::from_millis(100),
            closed: false,
        };
        drop(experiment);

        assert!(!ProcessManager::new().is_running(pid));
        assert!(!shm_path.exists());
    }
}
