//! Models command - list models known to the runtime.

use keeper_runtime::RuntimeConfig;

pub(crate) async fn run(config: RuntimeConfig) -> miette::Result<()> {
    let models = super::with_runtime(config, |supervisor| async move {
        supervisor
            .list_models()
            .await
            .map_err(|e| miette::miette!("Failed to list models: {}", e))
    })
    .await?;

    if models.is_empty() {
        println!("No models installed.");
        println!();
        println!("To pull the default model, run:");
        println!("  keeper pull");
        return Ok(());
    }

    println!("Installed models:");
    for model in models {
        println!("  - {}", model);
    }

    Ok(())
}
