//! Process shutdown signals.

use tokio::signal;
use tracing::info;

/// Wait for Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = ctrl_c => {
                result?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = terminate.recv() => {
                info!("Received terminate signal, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}
