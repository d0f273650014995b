//! Stop-orphans command - clean up runtime processes left behind by earlier runs.

use std::sync::Arc;

use keeper_runtime::conflict::ConflictResolver;
use keeper_runtime::process::SystemProcessTable;
use keeper_runtime::RuntimeConfig;

pub(crate) async fn run(config: &RuntimeConfig, force: bool) -> miette::Result<()> {
    let binary = super::binary_path(config)?;
    let resolver = ConflictResolver::new(config, &binary, Arc::new(SystemProcessTable::new()));

    let orphans = resolver.find_orphans(None);
    if orphans.is_empty() {
        println!("No runtime processes from {} are running.", binary.display());
        return Ok(());
    }

    for record in &orphans {
        println!("Stopping PID {}: {}", record.pid, record.command_line);
    }
    resolver.terminate_all(&orphans, force).await;
    println!("Stopped {} process(es).", orphans.len());

    Ok(())
}
