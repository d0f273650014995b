//! Process manager for the runtime's `serve` subprocess.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{RuntimeConfig, RUNTIME_HOST_ENV};
use crate::error::StartError;
use crate::logs::{self, StreamOrigin};
use crate::port::is_port_available;
use crate::process::{send_termination, Termination};

/// Starts and stops the runtime server process.
#[async_trait]
pub trait Launcher: Send {
    /// Spawn the server; returns the PID of the managed process.
    async fn start(&mut self) -> Result<u32, StartError>;

    /// Stop the managed process, if any. `graceful` escalates to a kill on timeout.
    async fn stop(&mut self, graceful: bool);

    /// PID of the managed process, if one is held.
    fn managed_pid(&self) -> Option<u32>;

    /// Reap the managed process if it has exited; true when none is running.
    fn has_exited(&mut self) -> bool;
}

/// A runtime process started by this controller.
struct ManagedProcess {
    child: Child,
    pid: u32,
    readers: Vec<JoinHandle<()>>,
}

/// Owns at most one runtime `serve` process.
pub struct ServiceController {
    binary: PathBuf,
    host_value: String,
    host: String,
    port: u16,
    graceful_timeout: Duration,
    forced_timeout: Duration,
    early_exit_grace: Duration,
    process: Option<ManagedProcess>,
}

impl ServiceController {
    pub fn new(config: &RuntimeConfig, binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            host_value: config.runtime_host_value(),
            host: config.host.clone(),
            port: config.port,
            graceful_timeout: config.graceful_stop_timeout,
            forced_timeout: config.forced_stop_timeout,
            early_exit_grace: config.early_exit_grace,
            process: None,
        }
    }

    /// Get the port the runtime is told to serve on.
    pub fn port(&self) -> u16 {
        self.port
    }

    async fn kill(process: &mut ManagedProcess, limit: Duration) {
        if let Err(e) = process.child.start_kill() {
            debug!("Kill of PID {} failed: {}", process.pid, e);
        }
        match timeout(limit, process.child.wait()).await {
            Ok(Ok(status)) => debug!("Runtime exited with status: {:?}", status),
            Ok(Err(e)) => warn!("Error waiting for runtime: {}", e),
            Err(_) => warn!("Runtime (PID {}) still alive after kill", process.pid),
        }
    }

    async fn release_readers(readers: Vec<JoinHandle<()>>) {
        for mut reader in readers {
            // Readers end on EOF; a grandchild holding the pipe must not stall us.
            if timeout(Duration::from_millis(200), &mut reader).await.is_err() {
                reader.abort();
            }
        }
    }
}

#[async_trait]
impl Launcher for ServiceController {
    async fn start(&mut self) -> Result<u32, StartError> {
        if let Some(pid) = self.managed_pid() {
            if !self.has_exited() {
                debug!("Runtime already managed (PID {})", pid);
                return Ok(pid);
            }
        }

        if !self.binary.exists() {
            return Err(StartError::BinaryNotFound(self.binary.display().to_string()));
        }

        info!("Starting runtime on {}", self.host_value);

        let mut child = Command::new(&self.binary)
            .arg("serve")
            .env(RUNTIME_HOST_ENV, &self.host_value)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StartError::SpawnFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| StartError::SpawnFailed("process exited before it had a PID".into()))?;
        debug!("Runtime process started with PID: {}", pid);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, pid, StreamOrigin::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, pid, StreamOrigin::Stderr));
        }

        sleep(self.early_exit_grace).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                Self::release_readers(readers).await;
                if !is_port_available(&self.host, self.port) {
                    warn!("Runtime exited ({}) while port {} is taken", status, self.port);
                    return Err(StartError::AlreadyRunningElsewhere(self.port));
                }
                Err(StartError::SpawnFailed(format!("exited immediately with {}", status)))
            }
            Ok(None) => {
                self.process = Some(ManagedProcess {
                    child,
                    pid,
                    readers,
                });
                Ok(pid)
            }
            Err(e) => {
                let _ = child.start_kill();
                Self::release_readers(readers).await;
                Err(StartError::SpawnFailed(e.to_string()))
            }
        }
    }

    async fn stop(&mut self, graceful: bool) {
        let Some(mut process) = self.process.take() else {
            return;
        };

        info!(
            "Stopping runtime (PID: {}, graceful: {})",
            process.pid, graceful
        );

        let mut exited = false;
        if graceful {
            match send_termination(process.pid, Termination::Graceful) {
                Ok(()) => match timeout(self.graceful_timeout, process.child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!("Runtime exited with status: {:?}", status);
                        exited = true;
                    }
                    Ok(Err(e)) => warn!("Error waiting for runtime: {}", e),
                    Err(_) => warn!("Runtime didn't exit gracefully, killing..."),
                },
                Err(e) => warn!("Graceful stop of PID {} failed: {}", process.pid, e),
            }
        }

        if !exited {
            Self::kill(&mut process, self.forced_timeout).await;
        }

        Self::release_readers(process.readers).await;
    }

    fn managed_pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    fn has_exited(&mut self) -> bool {
        let Some(process) = self.process.as_mut() else {
            return true;
        };
        match process.child.try_wait() {
            Ok(None) => false,
            Ok(Some(status)) => {
                info!("Runtime (PID {}) exited: {}", process.pid, status);
                if let Some(process) = self.process.take() {
                    for reader in process.readers {
                        reader.abort();
                    }
                }
                true
            }
            Err(e) => {
                warn!("Error checking runtime status: {}", e);
                false
            }
        }
    }
}

fn spawn_reader<R>(stream: R, pid: u32, origin: StreamOrigin) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = logs::strip_ansi(&line);
                    if !line.trim().is_empty() {
                        logs::emit("runtime", Some(pid), origin, line.trim_end());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Runtime {} reader error: {}", origin.as_str(), e);
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::{tempdir, TempDir};

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("ollama");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn controller(dir: &TempDir, body: &str, port: u16) -> ServiceController {
        let config = RuntimeConfig::builder()
            .port(port)
            .graceful_stop_timeout(Duration::from_millis(500))
            .forced_stop_timeout(Duration::from_secs(1))
            .early_exit_grace(Duration::from_millis(200))
            .build();
        ServiceController::new(&config, script(dir.path(), body))
    }

    #[tokio::test]
    async fn test_start_and_graceful_stop() {
        let dir = tempdir().unwrap();
        let mut ctl = controller(&dir, "echo \"level=INFO msg=listening\"\nexec sleep 30", free_port());

        let pid = ctl.start().await.unwrap();
        assert_eq!(ctl.managed_pid(), Some(pid));
        assert!(!ctl.has_exited());

        // A second start reuses the live process.
        assert_eq!(ctl.start().await.unwrap(), pid);

        ctl.stop(true).await;
        assert_eq!(ctl.managed_pid(), None);
    }

    #[tokio::test]
    async fn test_forced_stop_when_term_ignored() {
        let dir = tempdir().unwrap();
        let mut ctl = controller(&dir, "trap '' TERM\nwhile true; do sleep 1; done", free_port());
        ctl.start().await.unwrap();

        let started = Instant::now();
        ctl.stop(true).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ctl.managed_pid(), None);
    }

    #[tokio::test]
    async fn test_early_exit_is_spawn_failure() {
        let dir = tempdir().unwrap();
        let mut ctl = controller(&dir, "echo boom >&2\nexit 3", free_port());
        let err = ctl.start().await.unwrap_err();
        assert!(matches!(err, StartError::SpawnFailed(_)));
        assert_eq!(ctl.managed_pid(), None);
    }

    #[tokio::test]
    async fn test_early_exit_with_port_taken() {
        let dir = tempdir().unwrap();
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut ctl = controller(&dir, "echo 'Error: address already in use' >&2\nexit 1", port);
        let err = ctl.start().await.unwrap_err();
        assert!(matches!(err, StartError::AlreadyRunningElsewhere(p) if p == port));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempdir().unwrap();
        let config = RuntimeConfig::default();
        let mut ctl = ServiceController::new(&config, dir.path().join("absent"));
        assert!(matches!(ctl.start().await, Err(StartError::BinaryNotFound(_))));
    }

    #[tokio::test]
    async fn test_natural_exit_is_reaped() {
        let dir = tempdir().unwrap();
        let mut ctl = controller(&dir, "sleep 0.5", free_port());
        ctl.start().await.unwrap();

        sleep(Duration::from_millis(800)).await;
        assert!(ctl.has_exited());
        assert_eq!(ctl.managed_pid(), None);
    }
}
