use std::future::Future;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::oneshot;

/// Waits for SIGINT or SIGTERM.
async fn termination() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Spawns the signal listener. The returned receiver fires once when a
/// termination signal arrives. If the process is still alive
/// `force_exit_after` later, usually because a tick is stuck on a hung
/// command, the listener exits with status 0.
pub fn listen(force_exit_after: Duration) -> oneshot::Receiver<()> {
    listen_on(termination(), force_exit_after, || {
        std::process::exit(0);
    })
}

/// Like [`listen`], with the signal source and the exit action supplied.
/// If `signal` fails the sender is dropped, so the receiver reports closed
/// instead of firing.
fn listen_on<S, E>(signal: S, force_exit_after: Duration, force_exit: E) -> oneshot::Receiver<()>
where
    S: Future<Output = std::io::Result<()>> + Send + 'static,
    E: FnOnce() + Send + 'static,
{
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        if let Err(err) = signal.await {
            error!("Unable to listen for shutdown signals: {}", err);
            return;
        }
        info!("Received shutdown signal, initiating graceful shutdown");
        // The loop may already be gone if it returned on its own.
        let _ = tx.send(());

        tokio::time::sleep(force_exit_after).await;
        warn!("Shutdown did not finish within {:?}, exiting", force_exit_after);
        force_exit();
    });

    rx
}
