//! Runs one subscription on a tokio task.

use crate::error::EntityDataError;
use crate::subscription::EntityDataSubscription;
use crate::transport::SubscriberEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCommand {
    Start,
    Unsubscribe,
}

/// Control handle of a driven subscription. Dropping every clone tears the
/// subscription down.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    command_tx: mpsc::Sender<DriverCommand>,
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    pub async fn start(&self) -> Result<(), EntityDataError> {
        self.send(DriverCommand::Start).await
    }

    pub async fn unsubscribe(&self) -> Result<(), EntityDataError> {
        self.send(DriverCommand::Unsubscribe).await
    }

    /// Stops the task without waiting for queued commands.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn send(&self, command: DriverCommand) -> Result<(), EntityDataError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|e| EntityDataError::ChannelError(e.to_string()))
    }
}

/// Spawns the event loop. Call `subscribe()` on the subscription first and
/// keep its receiver for the initial load.
pub fn spawn(
    mut subscription: EntityDataSubscription,
    mut events: mpsc::UnboundedReceiver<SubscriberEvent>,
) -> (SubscriptionHandle, JoinHandle<()>) {
    let (command_tx, mut command_rx) = mpsc::channel(16);
    let cancel = subscription.cancellation_token();
    let handle = SubscriptionHandle {
        command_tx,
        cancel: cancel.clone(),
    };

    let task = tokio::spawn(async move {
        let mut events_closed = false;

        loop {
            let wait = subscription.time_until_next_deadline();

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Subscription driver cancelled");
                    break;
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(DriverCommand::Start) => subscription.start(),
                        Some(DriverCommand::Unsubscribe) | None => break,
                    }
                }
                event = events.recv(), if !events_closed => {
                    match event {
                        Some(event) => subscription.on_event(event),
                        None => {
                            debug!("Transport event stream closed");
                            events_closed = true;
                        }
                    }
                }
                _ = sleep(wait.unwrap_or_default()), if wait.is_some() => {
                    subscription.fire_due_timers();
                }
            }
        }

        subscription.unsubscribe();
    });

    (handle, task)
}
