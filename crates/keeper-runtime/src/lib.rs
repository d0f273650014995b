//! Local inference runtime supervisor.
//!
//! Installs the Ollama runtime into a per-user location, starts and watches
//! its `serve` process on a loopback port, clears stale instances of itself
//! from that port, and makes sure a model is pulled before generation
//! requests go out. Everything is driven through [`RuntimeSupervisor`].

pub mod client;
pub mod config;
pub mod conflict;
mod error;
pub mod exit;
pub mod health;
pub mod install;
pub mod logs;
pub mod model;
pub mod paths;
pub mod port;
pub mod process;
pub mod server;
mod supervisor;

#[cfg(test)]
mod testing;

pub use client::GenerationClient;
pub use config::RuntimeConfig;
pub use error::{
    ClientError, ConflictError, HealthError, InstallError, ModelError, StartError,
    SupervisorError,
};
pub use exit::install_exit_hook;
pub use model::ModelState;
pub use supervisor::{Components, ProgressFn, RuntimeSupervisor, ServiceState};

/// Loopback host the runtime binds to.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port of the runtime's HTTP API.
pub const DEFAULT_PORT: u16 = 11434;

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gemma3:1b";
