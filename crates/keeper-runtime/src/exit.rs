//! Process-exit hook: force-stop the runtime when the host is interrupted.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::supervisor::RuntimeSupervisor;

/// Exit status used after an interrupt.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Wait for Ctrl-C (or SIGTERM on unix), force-stop everything the
/// supervisor started, then exit the process.
///
/// Spawned children are also `kill_on_drop`, which covers exits that
/// bypass this hook.
pub fn install_exit_hook(supervisor: RuntimeSupervisor) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("Termination requested, stopping local runtime");
        supervisor.force_shutdown().await;
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Could not install SIGTERM handler: {}", e),
        }
    }

    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
