//! Termination signals
//!
//! SIGINT, SIGTERM and SIGHUP all cancel the same token. Every wait in a
//! session watches that token, so a signal takes the normal teardown path.

use std::io;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Install signal handlers that cancel `cancel` on the first signal.
///
/// Handlers are registered before this returns, so a failure to install
/// them is reported here rather than lost in the background task.
pub fn cancel_on_signal(cancel: CancellationToken) -> io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
                _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down..."),
                _ = sighup.recv() => tracing::info!("Received SIGHUP, shutting down..."),
                _ = cancel.cancelled() => return,
            }
            cancel.cancel();
        }))
    }

    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        tracing::info!("Received Ctrl+C, shutting down...");
                        cancel.cancel();
                    }
                }
                _ = cancel.cancelled() => {}
            }
        }))
    }
}
