use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        res = ctrl_c => {
            res?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

/// Cancel `token` once a shutdown signal arrives.
pub fn cancel_on_shutdown_signal(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!("failed to listen for shutdown signals: {}", e);
        }
        token.cancel();
    });
}
