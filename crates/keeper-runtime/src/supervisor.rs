//! Runtime supervisor: the single entry point callers depend on.
//!
//! All operations run on one worker task, one at a time, so install/start/
//! conflict sequences from concurrent callers never interleave. Forced
//! shutdown travels on its own channel and pre-empts whatever is in flight.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::conflict::{ConflictOutcome, ConflictResolver};
use crate::error::{InstallError, StartError, SupervisorError};
use crate::health::{HealthCheck, HealthMonitor};
use crate::install::{InstallationManager, Installer};
use crate::model::{ModelProvisioner, ModelState};
use crate::paths::InstallLayout;
use crate::process::{ProcessTable, SystemProcessTable};
use crate::server::{Launcher, ServiceController};

/// Wall-clock budget for [`RuntimeSupervisor::force_shutdown`].
pub const FORCE_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Lifecycle of the runtime service as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unknown,
    NotInstalled,
    Installed,
    Starting,
    Running,
    ConflictDetected,
    Failed,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Unknown => "unknown",
            ServiceState::NotInstalled => "not installed",
            ServiceState::Installed => "installed",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::ConflictDetected => "conflict detected",
            ServiceState::Failed => "failed",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Callback receiving model pull progress.
pub type ProgressFn = Box<dyn FnMut(&ModelState) + Send>;

/// The collaborators the supervisor orchestrates.
pub struct Components {
    pub installer: Box<dyn Installer>,
    pub launcher: Box<dyn Launcher>,
    pub health: Arc<dyn HealthCheck>,
    pub resolver: ConflictResolver,
    pub models: ModelProvisioner,
}

impl Components {
    /// Real components for `config`.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, InstallError> {
        let layout = match &config.layout {
            Some(layout) => layout.clone(),
            None => InstallLayout::detect()?,
        };
        let binary = layout.binary_path().to_path_buf();
        let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());

        Ok(Self {
            installer: Box::new(InstallationManager::new(config, layout)?),
            launcher: Box::new(ServiceController::new(config, &binary)),
            health: Arc::new(HealthMonitor::new(config)),
            resolver: ConflictResolver::new(config, &binary, table),
            models: ModelProvisioner::new(config, &binary),
        })
    }
}

enum Request {
    EnsureRunning {
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    EnsureModel {
        model: String,
        on_progress: Option<ProgressFn>,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    ListModels {
        reply: oneshot::Sender<Result<Vec<String>, SupervisorError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the supervisor worker. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeSupervisor {
    requests: mpsc::Sender<Request>,
    force: mpsc::Sender<oneshot::Sender<()>>,
    state: watch::Receiver<ServiceState>,
    transitions: broadcast::Sender<ServiceState>,
    base_url: String,
    default_model: String,
}

impl RuntimeSupervisor {
    /// Spawn a supervisor with real components. Must be called inside a tokio runtime.
    pub fn spawn(config: RuntimeConfig) -> Result<Self, SupervisorError> {
        let components = Components::from_config(&config)?;
        Ok(Self::with_components(config, components))
    }

    /// Spawn a supervisor over the given components.
    pub fn with_components(config: RuntimeConfig, components: Components) -> Self {
        let (request_tx, request_rx) = mpsc::channel(32);
        let (force_tx, force_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ServiceState::Unknown);
        let (transitions, _) = broadcast::channel(64);

        let worker = Worker {
            components,
            state: state_tx,
            transitions: transitions.clone(),
            ready_attempts: config.ready_attempts,
            start_attempts: config.start_attempts,
            launched: false,
        };
        tokio::spawn(worker.run(request_rx, force_rx));

        Self {
            requests: request_tx,
            force: force_tx,
            state: state_rx,
            transitions,
            base_url: config.base_url(),
            default_model: config.default_model,
        }
    }

    /// Current service state.
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Receive every state transition from now on, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceState> {
        self.transitions.subscribe()
    }

    /// Base URL of the runtime HTTP API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Model used when callers don't name one.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, SupervisorError>>) -> Request,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::WorkerStopped)?;
        rx.await.map_err(|_| SupervisorError::WorkerStopped)?
    }

    /// Make sure the runtime is installed, running and answering.
    pub async fn ensure_service_running(&self) -> Result<(), SupervisorError> {
        self.call(|reply| Request::EnsureRunning { reply }).await
    }

    /// Make sure `model` is present; the service must already be running.
    pub async fn ensure_model_ready(
        &self,
        model: &str,
        on_progress: Option<ProgressFn>,
    ) -> Result<(), SupervisorError> {
        let model = model.to_string();
        self.call(|reply| Request::EnsureModel {
            model,
            on_progress,
            reply,
        })
        .await
    }

    /// Models known to the runtime.
    pub async fn list_models(&self) -> Result<Vec<String>, SupervisorError> {
        self.call(|reply| Request::ListModels { reply }).await
    }

    /// Stop the managed process and any orphaned runtime processes, then
    /// stop the worker.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Shutdown { reply })
            .await
            .map_err(|_| SupervisorError::WorkerStopped)?;
        rx.await.map_err(|_| SupervisorError::WorkerStopped)
    }

    /// Kill everything without waiting for graceful exits. Returns within
    /// [`FORCE_SHUTDOWN_BUDGET`] and pre-empts any in-flight operation.
    pub async fn force_shutdown(&self) {
        let forced = async {
            let (ack, done) = oneshot::channel();
            if self.force.send(ack).await.is_err() {
                return;
            }
            let _ = done.await;
        };
        if timeout(FORCE_SHUTDOWN_BUDGET, forced).await.is_err() {
            warn!("Forced shutdown exceeded {:?}", FORCE_SHUTDOWN_BUDGET);
        }
    }
}

struct Worker {
    components: Components,
    state: watch::Sender<ServiceState>,
    transitions: broadcast::Sender<ServiceState>,
    ready_attempts: u32,
    start_attempts: u32,
    /// Set once this worker has started a runtime process itself.
    launched: bool,
}

impl Worker {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut force: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(ack) = force.recv() => {
                    self.shutdown(true).await;
                    let _ = ack.send(());
                    break;
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        debug!("All supervisor handles dropped");
                        self.shutdown(false).await;
                        break;
                    };
                    let stop_after = matches!(request, Request::Shutdown { .. });

                    let preempted = {
                        let work = self.handle(request);
                        tokio::pin!(work);
                        tokio::select! {
                            biased;
                            Some(ack) = force.recv() => Some(ack),
                            _ = &mut work => None,
                        }
                    };

                    if let Some(ack) = preempted {
                        warn!("Forced shutdown interrupted an in-flight operation");
                        self.shutdown(true).await;
                        let _ = ack.send(());
                        break;
                    }
                    if stop_after {
                        break;
                    }
                }
            }
        }
        debug!("Supervisor worker exiting");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::EnsureRunning { reply } => {
                let result = self.ensure_running().await;
                let _ = reply.send(result);
            }
            Request::EnsureModel {
                model,
                on_progress,
                reply,
            } => {
                let result = self.ensure_model(&model, on_progress).await;
                let _ = reply.send(result);
            }
            Request::ListModels { reply } => {
                let result = self
                    .components
                    .models
                    .list_models()
                    .await
                    .map_err(SupervisorError::from);
                let _ = reply.send(result);
            }
            Request::Shutdown { reply } => {
                self.shutdown(false).await;
                let _ = reply.send(());
            }
        }
    }

    fn set_state(&self, next: ServiceState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Runtime state: {} -> {}", previous, next);
            let _ = self.transitions.send(next);
        }
    }

    fn current_state(&self) -> ServiceState {
        *self.state.borrow()
    }

    fn fail(&self, err: impl Into<SupervisorError>) -> Result<(), SupervisorError> {
        let err = err.into();
        error!("Runtime unavailable: {}", err);
        self.set_state(ServiceState::Failed);
        Err(err)
    }

    async fn ensure_running(&mut self) -> Result<(), SupervisorError> {
        let c = &mut self.components;

        if c.health.check_with_retries(self.ready_attempts).await.is_ok() {
            debug!("Runtime already answering");
            let child_gone = c.launcher.managed_pid().is_none() || c.launcher.has_exited();
            if self.launched && child_gone {
                info!("Our runtime exited; the instance answering now is not ours");
                self.launched = false;
            }
            self.set_state(ServiceState::Running);
            return Ok(());
        }

        if !c.installer.is_installed() {
            self.set_state(ServiceState::NotInstalled);
            if let Err(e) = self.components.installer.install().await {
                return self.fail(e);
            }
        }
        self.set_state(ServiceState::Installed);

        let c = &mut self.components;
        if let Some(pid) = c.launcher.managed_pid() {
            if !c.launcher.has_exited() {
                warn!("Managed runtime (PID {}) is not answering; restarting", pid);
                c.launcher.stop(true).await;
            }
        }

        let own_pid = c.launcher.managed_pid();
        let preflight = c.resolver.resolve(c.health.as_ref(), own_pid).await;
        match preflight {
            Ok(ConflictOutcome::NoConflict) => {}
            Ok(ConflictOutcome::Resolved(records)) => {
                self.set_state(ServiceState::ConflictDetected);
                info!("Cleared {} stale runtime process(es)", records.len());
            }
            Err(e) => {
                self.set_state(ServiceState::ConflictDetected);
                return self.fail(e);
            }
        }

        self.set_state(ServiceState::Starting);
        let c = &mut self.components;
        let started = c.launcher.start().await;
        match started {
            Ok(pid) => {
                info!("Runtime started (PID {})", pid);
                self.launched = true;
            }
            Err(StartError::AlreadyRunningElsewhere(port)) => {
                // Another instance won the race for the port; adopt it if it answers.
                if c.health.check_with_retries(self.start_attempts).await.is_ok() {
                    if c.launcher.managed_pid().is_none() {
                        self.launched = false;
                    }
                    self.set_state(ServiceState::Running);
                    return Ok(());
                }
                return self.fail(StartError::AlreadyRunningElsewhere(port));
            }
            Err(e) => return self.fail(e),
        }

        let c = &mut self.components;
        let polled = c.health.check_with_retries(self.start_attempts).await;
        match polled {
            Ok(()) => {
                info!("Runtime is ready");
                self.set_state(ServiceState::Running);
                Ok(())
            }
            Err(e) => {
                c.launcher.stop(true).await;
                self.fail(e)
            }
        }
    }

    async fn ensure_model(
        &mut self,
        model: &str,
        mut on_progress: Option<ProgressFn>,
    ) -> Result<(), SupervisorError> {
        let state = self.current_state();
        if state != ServiceState::Running {
            return Err(SupervisorError::NotRunning(state));
        }

        self.components
            .models
            .ensure_ready(model, |progress| {
                if let Some(callback) = on_progress.as_mut() {
                    callback(progress);
                }
            })
            .await
            .map_err(SupervisorError::from)
    }

    async fn shutdown(&mut self, forced: bool) {
        let c = &mut self.components;
        let own_pid = c.launcher.managed_pid();
        c.launcher.stop(!forced).await;

        // An adopted instance belongs to someone else; leave its processes alone.
        if self.launched {
            let orphans = c.resolver.find_orphans(own_pid);
            if !orphans.is_empty() {
                info!("Stopping {} orphaned runtime process(es)", orphans.len());
                c.resolver.terminate_all(&orphans, forced).await;
            }
        }

        self.set_state(ServiceState::Stopped);
        info!("Runtime supervisor stopped");
    }
}
