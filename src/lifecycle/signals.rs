//! OS signal handling.
//!
//! # Responsibilities
//! - Register handlers for SIGINT and SIGTERM
//! - Turn the first signal into a clean outcome (normal shutdown trigger)
//! - Unblock with [`ActorError::Canceled`] when a sibling actor already
//!   triggered shutdown
//!
//! # Design Decisions
//! - Handlers are installed when the watcher is created, not when it starts
//!   waiting, so a signal delivered during startup is not lost
//! - Any other signal keeps its default disposition

use std::io;

use tokio::sync::oneshot;

use crate::lifecycle::actor::{ActorError, Outcome};
use crate::lifecycle::group::Group;

/// Waits for a termination signal or an external cancellation.
pub struct SignalWatcher {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl SignalWatcher {
    /// Install the signal handlers. Must be called within a Tokio runtime.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Block until a signal arrives (clean outcome) or `cancel` is closed or
    /// fired (canceled outcome).
    pub async fn wait(mut self, cancel: oneshot::Receiver<()>) -> Outcome {
        tokio::select! {
            signal = self.next_signal() => {
                tracing::info!(signal = signal, "Caught signal, exiting");
                Ok(())
            }
            _ = cancel => Err(ActorError::Canceled),
        }
    }

    #[cfg(unix)]
    async fn next_signal(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    async fn next_signal(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending().await
            }
        }
    }

    /// Register the watcher as an actor. Its interrupt closes the
    /// cancellation channel it waits on.
    pub fn register(self, group: &mut Group) {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        group.add("signal", self.wait(cancel_rx), move |_| drop(cancel_tx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancellation_produces_canceled_outcome() {
        let watcher = SignalWatcher::install().unwrap();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(watcher.wait(cancel_rx));

        drop(cancel_tx);

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("watcher must not leak")
            .unwrap();
        assert!(matches!(outcome, Err(ActorError::Canceled)));
    }

    #[tokio::test]
    async fn registered_watcher_is_canceled_by_sibling() {
        let mut group = Group::new();
        SignalWatcher::install().unwrap().register(&mut group);
        group.add("work", async { Ok(()) }, |_| {});

        let outcome = tokio::time::timeout(Duration::from_secs(1), group.run())
            .await
            .expect("group must finish");
        assert!(outcome.is_ok());
    }
}
