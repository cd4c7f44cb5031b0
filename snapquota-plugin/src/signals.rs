//! Process signal handling for the plugin session

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::info;
use snapquota_core::Result;

use crate::session::SessionControl;

/// Forward `SIGHUP` as a restart and `SIGINT`/`SIGTERM`/`SIGQUIT` as a
/// shutdown to the session
///
/// The watcher ends once the session no longer accepts requests.
///
/// # Errors
/// Returns [`snapquota_core::Error::Io`] if a signal handler cannot be installed
pub fn spawn_signal_watcher(control: SessionControl) -> Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let delivered = tokio::select! {
                _ = hangup.recv() => {
                    info!("Received SIGHUP, restarting");
                    control.restart().await
                }
                _ = interrupt.recv() => {
                    info!(signal = "SIGINT", "Received signal, shutting down");
                    control.shutdown().await
                }
                _ = terminate.recv() => {
                    info!(signal = "SIGTERM", "Received signal, shutting down");
                    control.shutdown().await
                }
                _ = quit.recv() => {
                    info!(signal = "SIGQUIT", "Received signal, shutting down");
                    control.shutdown().await
                }
            };
            if delivered.is_err() {
                break;
            }
        }
    }))
}
