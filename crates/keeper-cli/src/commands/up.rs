//! Up command - bring the runtime up and hold it until interrupted.

use keeper_runtime::RuntimeConfig;

pub(crate) async fn run(config: RuntimeConfig) -> miette::Result<()> {
    let supervisor = super::running_supervisor(config).await?;

    println!("Runtime is running at {}", supervisor.base_url());
    println!("Press Ctrl-C to stop.");

    // The exit hook force-stops the runtime and exits the process.
    std::future::pending::<()>().await;
    Ok(())
}
