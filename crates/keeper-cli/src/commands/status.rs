//! Status command - probe the runtime without changing anything.

use serde::Serialize;

use keeper_runtime::health::{HealthCheck, HealthMonitor};
use keeper_runtime::model::{ModelProvisioner, ModelState};
use keeper_runtime::RuntimeConfig;

#[derive(Serialize)]
struct StatusReport {
    endpoint: String,
    binary: String,
    installed: bool,
    ready: bool,
    reason: String,
    model: String,
    model_state: String,
}

pub(crate) async fn run(config: &RuntimeConfig, json: bool) -> miette::Result<()> {
    let binary = super::binary_path(config)?;
    let installed = super::is_installed(config)?;

    let report = HealthMonitor::new(config).check_once().await;
    let model_state = if report.ready && installed {
        match ModelProvisioner::new(config, &binary)
            .status(&config.default_model)
            .await
        {
            ModelState::Ready => "ready".to_string(),
            ModelState::NotPresent => "not present".to_string(),
            ModelState::Downloading(line) => format!("downloading ({})", line),
            ModelState::Failed(reason) => format!("unknown ({})", reason),
        }
    } else {
        "unknown".to_string()
    };

    let status = StatusReport {
        endpoint: config.base_url(),
        binary: binary.display().to_string(),
        installed,
        ready: report.ready,
        reason: report.reason,
        model: config.default_model.clone(),
        model_state,
    };

    if json {
        let out = serde_json::to_string_pretty(&status)
            .map_err(|e| miette::miette!("Failed to serialize status: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    println!("Endpoint:  {}", status.endpoint);
    println!("Binary:    {}", status.binary);
    println!("  Installed: {}", status.installed);
    println!(
        "Runtime:   {} ({})",
        if status.ready { "ready" } else { "not ready" },
        status.reason
    );
    println!("Model:     {} [{}]", status.model, status.model_state);

    Ok(())
}
