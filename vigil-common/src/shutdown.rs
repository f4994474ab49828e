//! Process shutdown plumbing.
//!
//! Binaries create one [`CancellationToken`] at their composition root and
//! hand child tokens (or clones) to every long-lived task. The token is
//! cancelled either by an OS signal or by a service that encountered a fatal
//! error and dropped its guard; `main` then waits (bounded) for the tasks to
//! drain.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio_util::sync::CancellationToken;

/// Completes when the process receives SIGINT or SIGTERM.
pub async fn default_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("can install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("can install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Spawns a task that cancels the returned token when `signal` completes.
///
/// The returned flag starts out `true` and is meant to be flipped to `false`
/// by `main` if the services do not drain within the shutdown deadline, so
/// the process can exit with a failure code.
pub fn spawn_shutdown_task(
    signal: impl Future<Output = ()> + Send + 'static,
) -> (CancellationToken, Arc<AtomicBool>) {
    let cancellation_token = CancellationToken::new();
    let is_graceful = Arc::new(AtomicBool::new(true));
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            tokio::select! {
                _ = signal => {
                    tracing::info!("received shutdown signal");
                    cancellation_token.cancel();
                }
                _ = cancellation_token.cancelled() => {}
            }
        }
    });
    (cancellation_token, is_graceful)
}
