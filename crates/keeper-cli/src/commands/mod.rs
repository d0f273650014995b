//! CLI commands.

use std::future::Future;
use std::path::PathBuf;

use keeper_runtime::install::{InstallationManager, Installer};
use keeper_runtime::paths::InstallLayout;
use keeper_runtime::{install_exit_hook, RuntimeConfig, RuntimeSupervisor};

pub mod generate;
pub mod info;
pub mod models;
pub mod pull;
pub mod status;
pub mod stop_orphans;
pub mod up;

pub(crate) fn load_config(port: Option<u16>) -> RuntimeConfig {
    let mut config = RuntimeConfig::from_env();
    if let Some(port) = port {
        config.port = port;
    }
    config
}

pub(crate) fn block_on<F>(fut: F) -> miette::Result<()>
where
    F: Future<Output = miette::Result<()>>,
{
    tokio::runtime::Runtime::new()
        .map_err(|e| miette::miette!("Failed to start async runtime: {}", e))?
        .block_on(fut)
}

pub(crate) fn install_layout(config: &RuntimeConfig) -> miette::Result<InstallLayout> {
    match &config.layout {
        Some(layout) => Ok(layout.clone()),
        None => InstallLayout::detect().map_err(|e| miette::miette!("{}", e)),
    }
}

pub(crate) fn binary_path(config: &RuntimeConfig) -> miette::Result<PathBuf> {
    Ok(install_layout(config)?.binary_path().to_path_buf())
}

/// Same check the supervisor makes before deciding to install.
pub(crate) fn is_installed(config: &RuntimeConfig) -> miette::Result<bool> {
    let manager = InstallationManager::new(config, install_layout(config)?)
        .map_err(|e| miette::miette!("Failed to set up installer: {}", e))?;
    Ok(manager.is_installed())
}

/// Start a supervisor, with Ctrl-C wired to a forced shutdown, and bring the
/// runtime up.
pub(crate) async fn running_supervisor(config: RuntimeConfig) -> miette::Result<RuntimeSupervisor> {
    let supervisor =
        RuntimeSupervisor::spawn(config).map_err(|e| miette::miette!("Failed to set up runtime: {}", e))?;
    install_exit_hook(supervisor.clone());

    if let Err(e) = supervisor.ensure_service_running().await {
        supervisor.shutdown().await.ok();
        return Err(miette::miette!("Runtime is not available: {}", e));
    }
    Ok(supervisor)
}

/// Run `work` against a running supervisor, then stop what it started.
pub(crate) async fn with_runtime<T, F, Fut>(config: RuntimeConfig, work: F) -> miette::Result<T>
where
    F: FnOnce(RuntimeSupervisor) -> Fut,
    Fut: Future<Output = miette::Result<T>>,
{
    let supervisor = running_supervisor(config).await?;
    let result = work(supervisor.clone()).await;
    supervisor
        .shutdown()
        .await
        .map_err(|e| miette::miette!("Shutdown failed: {}", e))?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_for(binary: &std::path::Path) -> RuntimeConfig {
        RuntimeConfig::builder()
            .layout(InstallLayout::at(binary))
            .build()
    }

    #[test]
    fn test_missing_binary_is_not_installed() {
        let dir = tempdir().unwrap();
        let config = config_for(&dir.path().join("ollama"));
        assert!(!is_installed(&config).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_installed_needs_executable_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let binary = dir.path().join("ollama");
        std::fs::write(&binary, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o644)).unwrap();
        let config = config_for(&binary);
        assert!(binary.exists());
        assert!(!is_installed(&config).unwrap());

        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_installed(&config).unwrap());
    }
}
