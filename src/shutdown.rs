//! Process Signal Handling
//!
//! The engine has no graceful shutdown. The binary waits for a termination
//! signal next to the engine and simply exits when one arrives, dropping
//! every listener and relay with the runtime.

use tokio::signal;
use tracing::info;

use crate::Result;

/// Wait for SIGTERM, SIGINT or Ctrl+C and return the signal's name
pub async fn wait_for_signal() -> Result<&'static str> {
    info!("Starting shutdown signal listener");

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = signal::ctrl_c() => "Ctrl+C",
        };
        Ok(name)
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}
