//! In-memory stand-ins for the supervisor's collaborators.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{InstallError, StartError};
use crate::health::{HealthCheck, HealthReport};
use crate::install::Installer;
use crate::process::{ProcessEntry, ProcessTable, Termination};
use crate::server::Launcher;

#[derive(Clone)]
pub(crate) struct FakeInstaller {
    pub installed: Arc<AtomicBool>,
    pub installs: Arc<AtomicU32>,
    pub fail: Arc<AtomicBool>,
}

impl FakeInstaller {
    pub fn new(installed: bool) -> Self {
        Self {
            installed: Arc::new(AtomicBool::new(installed)),
            installs: Arc::new(AtomicU32::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    async fn install(&self) -> Result<(), InstallError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(InstallError::DownloadFailed("HTTP 404".into()));
        }
        self.installed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Launcher that flips a shared readiness flag when started.
#[derive(Clone)]
pub(crate) struct FakeLauncher {
    pub ready: Arc<AtomicBool>,
    pub starts: Arc<AtomicU32>,
    /// One entry per `stop` call, holding its `graceful` flag.
    pub stops: Arc<Mutex<Vec<bool>>>,
    /// Makes the held child look dead on the next `has_exited`.
    pub crashed: Arc<AtomicBool>,
    running: Option<u32>,
}

impl FakeLauncher {
    pub fn new(ready: Arc<AtomicBool>) -> Self {
        Self {
            ready,
            starts: Arc::new(AtomicU32::new(0)),
            stops: Arc::new(Mutex::new(Vec::new())),
            crashed: Arc::new(AtomicBool::new(false)),
            running: None,
        }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn start(&mut self) -> Result<u32, StartError> {
        if let Some(pid) = self.running {
            return Ok(pid);
        }
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = 40_000 + n;
        self.running = Some(pid);
        self.ready.store(true, Ordering::SeqCst);
        Ok(pid)
    }

    async fn stop(&mut self, graceful: bool) {
        self.stops.lock().unwrap().push(graceful);
        self.running = None;
        self.ready.store(false, Ordering::SeqCst);
    }

    fn managed_pid(&self) -> Option<u32> {
        self.running
    }

    fn has_exited(&mut self) -> bool {
        if self.crashed.swap(false, Ordering::SeqCst) {
            self.running = None;
        }
        self.running.is_none()
    }
}

#[derive(Clone)]
pub(crate) struct FakeHealth {
    pub ready: Arc<AtomicBool>,
    pub calls: Arc<AtomicU32>,
    stuck: bool,
}

impl FakeHealth {
    fn build(ready: bool, stuck: bool) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(ready)),
            calls: Arc::new(AtomicU32::new(0)),
            stuck,
        }
    }

    pub fn always_ready() -> Self {
        Self::build(true, false)
    }

    /// Ready once a [`FakeLauncher`] sharing the flag has started.
    pub fn ready_after_start() -> Self {
        Self::build(false, false)
    }

    pub fn never_ready() -> Self {
        Self::build(false, true)
    }
}

#[async_trait]
impl HealthCheck for FakeHealth {
    async fn check_once(&self) -> HealthReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.stuck && self.ready.load(Ordering::SeqCst) {
            HealthReport::ready("ok")
        } else {
            HealthReport::not_ready("connection refused")
        }
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(5)
    }
}

/// Synthetic process listing that records every signal.
#[derive(Default)]
pub(crate) struct FakeTable {
    pub on_port: Mutex<Vec<u32>>,
    pub commands: Mutex<HashMap<u32, String>>,
    pub alive: Mutex<Vec<u32>>,
    pub signals: Mutex<Vec<(u32, Termination)>>,
    /// Listener standing in for the process holding the port.
    pub holder: Mutex<Option<TcpListener>>,
}

impl FakeTable {
    pub fn with(entries: &[(u32, &str)]) -> Self {
        let table = Self::default();
        for (pid, cmd) in entries {
            table.commands.lock().unwrap().insert(*pid, cmd.to_string());
            table.alive.lock().unwrap().push(*pid);
        }
        table
    }

    pub fn kills(&self) -> Vec<(u32, Termination)> {
        self.signals.lock().unwrap().clone()
    }
}

impl ProcessTable for FakeTable {
    fn pids_on_port(&self, _port: u16) -> Vec<u32> {
        self.on_port.lock().unwrap().clone()
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        self.commands.lock().unwrap().get(&pid).cloned()
    }

    fn processes(&self) -> Vec<ProcessEntry> {
        let alive = self.alive.lock().unwrap().clone();
        let commands = self.commands.lock().unwrap();
        alive
            .into_iter()
            .map(|pid| ProcessEntry {
                pid,
                command_line: commands.get(&pid).cloned().unwrap_or_default(),
            })
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn terminate(&self, pid: u32, how: Termination) -> io::Result<()> {
        self.signals.lock().unwrap().push((pid, how));
        self.alive.lock().unwrap().retain(|p| *p != pid);
        // Last holder gone: free the port.
        let mut on_port = self.on_port.lock().unwrap();
        on_port.retain(|p| *p != pid);
        if on_port.is_empty() {
            self.holder.lock().unwrap().take();
        }
        Ok(())
    }
}
