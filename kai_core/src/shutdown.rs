use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// What ended a fuzzing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// The external trigger fired, normally Ctrl-C.
    Signal,
    /// The configured run duration elapsed.
    Deadline,
}

/// Waits until either `external` completes or `run_for` has elapsed, and
/// reports which came first. With no `run_for` only `external` can end the
/// wait.
pub async fn wait_for_shutdown<F>(external: F, run_for: Option<Duration>) -> ShutdownTrigger
where
    F: Future<Output = ()>,
{
    let deadline = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    let trigger = tokio::select! {
        _ = external => ShutdownTrigger::Signal,
        _ = deadline => ShutdownTrigger::Deadline,
    };
    info!(?trigger, "Shutdown requested");
    trigger
}

/// Resolves on Ctrl-C. If the handler cannot be installed this never
/// resolves, leaving the deadline as the only way out.
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn deadline_fires_without_external_trigger() {
        let started = Instant::now();
        let trigger =
            wait_for_shutdown(std::future::pending(), Some(Duration::from_millis(20))).await;
        assert_eq!(trigger, ShutdownTrigger::Deadline);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn external_trigger_beats_a_long_deadline() {
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(());
        });
        let external = async {
            let _ = rx.await;
        };
        let trigger = wait_for_shutdown(external, Some(Duration::from_secs(60))).await;
        assert_eq!(trigger, ShutdownTrigger::Signal);
    }

    #[tokio::test]
    async fn unbounded_runs_wait_for_the_external_trigger() {
        let trigger = wait_for_shutdown(async {}, None).await;
        assert_eq!(trigger, ShutdownTrigger::Signal);
    }
}
