//! Error types for runtime supervision.

use thiserror::Error;

/// Errors from acquiring and installing the runtime binary.
#[derive(Debug, Error)]
pub enum InstallError {
    /// No release artifact exists for this OS/architecture.
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    /// Downloading the release archive failed.
    #[error("failed to download runtime: {0}")]
    DownloadFailed(String),

    /// The archive could not be read or did not contain the expected executable.
    #[error("runtime archive is corrupt or incomplete: {0}")]
    ArchiveCorrupt(String),

    /// Checksum verification of the downloaded archive failed.
    #[error("archive checksum mismatch. Expected: {expected}, got: {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Could not determine where the runtime should be installed.
    #[error("could not determine install location: {0}")]
    NoInstallLocation(String),

    /// I/O error while installing.
    #[error("I/O error during install: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from starting the runtime process.
#[derive(Debug, Error)]
pub enum StartError {
    /// The child process could not be spawned or exited immediately.
    #[error("failed to start runtime: {0}")]
    SpawnFailed(String),

    /// The child exited at once because another instance holds the port.
    #[error("runtime exited at startup; port {0} is held by another instance")]
    AlreadyRunningElsewhere(u16),

    /// The runtime binary is missing from the install path.
    #[error("runtime binary not found at {0}")]
    BinaryNotFound(String),
}

/// Errors from port conflict resolution.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The port is held by a process that is not ours; it is left alone.
    #[error("port {port} is held by a foreign process (pid {pid}: {command})")]
    UnresolvedForeignOccupant {
        port: u16,
        pid: u32,
        command: String,
    },

    /// The port is held but no owning process could be identified.
    #[error("port {0} is occupied by an unidentified process")]
    UnidentifiedOccupant(u16),

    /// Terminating our own stale process failed or the port never freed up.
    #[error("failed to free port {port}: {reason}")]
    KillFailed { port: u16, reason: String },
}

/// Errors from readiness polling.
#[derive(Debug, Error)]
pub enum HealthError {
    /// The runtime never became ready within the attempt budget.
    #[error("runtime not ready after {attempts} attempts: {reason}")]
    Timeout { attempts: u32, reason: String },
}

/// Errors from model provisioning.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The pull subprocess failed.
    #[error("failed to pull model '{model}': {reason}")]
    PullFailed { model: String, reason: String },

    /// The pull finished but the model is still not listed.
    #[error("model '{0}' not found after pull")]
    NotFoundAfterPull(String),

    /// The listing subcommand failed.
    #[error("failed to list models: {0}")]
    ListFailed(String),
}

/// Top-level errors surfaced by [`crate::RuntimeSupervisor`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// A model operation was requested before the service was running.
    #[error("runtime service is not running (state: {0})")]
    NotRunning(crate::ServiceState),

    /// The supervisor worker has shut down.
    #[error("runtime supervisor has stopped")]
    WorkerStopped,
}

/// Errors from the generation client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A precondition (service or model readiness) failed.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The runtime returned an error response.
    #[error("runtime API error: {0}")]
    Api(String),
}
