//! Signal handling
//!
//! The first SIGINT or SIGTERM cancels the shared token so the robot can say
//! goodbye and park. A second signal cuts the motors and exits immediately.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::hardware::EmergencyStop;

/// Exit code used when a second signal forces the process down
pub const FORCED_EXIT: i32 = 130;

/// Spawn the signal listener; the returned token is cancelled on the first signal
#[must_use]
pub fn install(emergency: Arc<dyn EmergencyStop>) -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn(supervise(
        token.clone(),
        emergency,
        wait_for_signal,
        |code| std::process::exit(code),
    ));
    token
}

/// Cancel `token` on the first signal; stop the motors and call `exit` on the second
pub async fn supervise<S, F>(
    token: CancellationToken,
    emergency: Arc<dyn EmergencyStop>,
    mut signal: S,
    exit: impl FnOnce(i32),
) where
    S: FnMut() -> F,
    F: Future<Output = ()>,
{
    signal().await;
    tracing::info!("shutdown requested");
    token.cancel();

    signal().await;
    tracing::warn!("second signal, exiting now");
    emergency.stop_now();
    exit(FORCED_EXIT);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
