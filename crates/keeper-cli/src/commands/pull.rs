//! Pull command - make sure a model is present.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use keeper_runtime::{ModelState, RuntimeConfig};

pub(crate) async fn run(config: RuntimeConfig, model: Option<String>) -> miette::Result<()> {
    let model = model.unwrap_or_else(|| config.default_model.clone());

    super::with_runtime(config, |supervisor| async move {
        println!("Preparing model: {}", model);

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .map_err(|e| miette::miette!("Invalid progress template: {}", e))?,
        );
        pb.enable_steady_tick(Duration::from_millis(120));

        let bar = pb.clone();
        let result = supervisor
            .ensure_model_ready(
                &model,
                Some(Box::new(move |state: &ModelState| {
                    if let ModelState::Downloading(line) = state {
                        bar.set_message(line.clone());
                    }
                })),
            )
            .await;

        match result {
            Ok(()) => {
                pb.finish_and_clear();
                println!("Model '{}' is ready.", model);
                Ok(())
            }
            Err(e) => {
                pb.abandon();
                Err(miette::miette!("Failed to pull model '{}': {}", model, e))
            }
        }
    })
    .await
}
