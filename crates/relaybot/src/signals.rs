//! Signal handling for graceful shutdown.
//!
//! Cross-platform signal handling so the relay can close its connections
//! cleanly when asked to terminate.

use relay_events::ShutdownState;
use tokio::signal;
use tracing::info;

/// Waits for a termination signal (SIGINT, SIGTERM on Unix; Ctrl+C on
/// Windows), then flips the shared shutdown state and returns.
pub async fn wait_for_shutdown(
    shutdown: &ShutdownState,
) -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => ()
        }
    }

    #[cfg(windows)]
    signal::ctrl_c().await?;

    shutdown.initiate_shutdown();
    info!("Received shutdown signal - initiating graceful shutdown");
    Ok(())
}
