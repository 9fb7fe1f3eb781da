use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Waits for ctrl-c, or SIGTERM on unix, and cancels `cancelation`. `worktally stop` terminates
/// the daemon with SIGTERM, so both have to lead to a final snapshot being written.
///
/// On Windows detached processes can't detect signals sent to them, so the process is killed
/// without a final write.
pub async fn detect_shutdown(cancelation: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                select! {
                    _ = tokio::signal::ctrl_c() => info!("Received ctrl-c"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                };
                cancelation.cancel();
                return;
            }
            Err(e) => error!("Failed to listen for SIGTERM {e:?}"),
        }
    }

    select! {
        _ = tokio::signal::ctrl_c() => info!("Received ctrl-c"),
    };
    cancelation.cancel();
}
