//! Shutdown signalling
//!
//! A trigger/signal pair over a watch channel. Servers hold a
//! [`ShutdownSignal`] and stop accepting once it fires. Dropping the
//! [`ShutdownTrigger`] counts as a shutdown request.

use log::{error, info, warn};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;

/// Sending half, owned by whoever decides when to stop
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown of every subscribed server
    pub fn trigger(&self) {
        // send_replace succeeds even without receivers
        self.sender.send_replace(true);
    }

    /// Another signal bound to this trigger
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving half, cheap to clone
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown is requested or the trigger is dropped
    ///
    /// Cancel safe.
    pub async fn wait(&mut self) {
        // wait_for errors only when the sender is gone, which also means stop
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }
}

/// Create a connected trigger and signal
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger { sender }, ShutdownSignal { receiver })
}

/// Wait up to `grace` for `tasks` to finish, then abort what is left
pub async fn drain_tasks<T: 'static>(mut tasks: JoinSet<T>, grace: Duration, what: &str) {
    if tasks.is_empty() {
        return;
    }
    info!("Waiting up to {:?} for {} in-flight {}s", grace, tasks.len(), what);

    let finished = timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!("{} task panicked: {}", what, e);
                }
            }
        }
    })
    .await;

    if finished.is_err() {
        warn!("Aborting {} {}s still running after {:?}", tasks.len(), what, grace);
        tasks.shutdown().await;
    }
}
