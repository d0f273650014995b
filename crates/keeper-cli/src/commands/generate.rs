//! Generate command - one prompt, one response.

use keeper_runtime::{install_exit_hook, GenerationClient, RuntimeConfig, RuntimeSupervisor};

pub(crate) async fn run(
    config: RuntimeConfig,
    prompt: &str,
    model: Option<String>,
    fallback: bool,
) -> miette::Result<()> {
    let supervisor = RuntimeSupervisor::spawn(config)
        .map_err(|e| miette::miette!("Failed to set up runtime: {}", e))?;
    install_exit_hook(supervisor.clone());

    let client = GenerationClient::new(supervisor.clone());
    let result = if fallback {
        Ok(client.generate_or_fallback(prompt, model.as_deref()).await)
    } else {
        client
            .generate(prompt, model.as_deref())
            .await
            .map_err(|e| miette::miette!("Generation failed: {}", e))
    };

    supervisor
        .shutdown()
        .await
        .map_err(|e| miette::miette!("Shutdown failed: {}", e))?;

    println!("{}", result?);
    Ok(())
}
