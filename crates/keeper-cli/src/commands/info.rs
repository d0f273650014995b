//! Info command - show configuration and install paths.

use keeper_runtime::config::{ARCHIVE_SHA256_ENV, ENDPOINT_ENV, MODEL_ENV};
use keeper_runtime::paths::ReleaseArtifact;
use keeper_runtime::RuntimeConfig;

pub(crate) fn run(config: &RuntimeConfig) -> miette::Result<()> {
    println!("Keeper Local Runtime Configuration");
    println!("==================================");
    println!();
    println!("Version:          {}", env!("CARGO_PKG_VERSION"));
    println!("Endpoint:         {}", config.base_url());
    println!("Default model:    {}", config.default_model);
    println!();

    let binary = super::binary_path(config)?;
    println!("Runtime binary:   {}", binary.display());
    println!("  Installed: {}", super::is_installed(config)?);

    match ReleaseArtifact::current() {
        Ok(artifact) => {
            let url = config.archive_url.as_deref().unwrap_or(artifact.url.as_str());
            println!("Release archive:  {}", url);
        }
        Err(e) => println!("Release archive:  none ({})", e),
    }
    if let Some(sha) = &config.archive_sha256 {
        println!("  Expected SHA-256: {}", sha);
    }
    println!();

    println!("Environment overrides:");
    println!("  {:<22} endpoint URL", ENDPOINT_ENV);
    println!("  {:<22} default model", MODEL_ENV);
    println!("  {:<22} archive checksum", ARCHIVE_SHA256_ENV);

    Ok(())
}
