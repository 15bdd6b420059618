use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::notification::{RefreshTrigger, UnreadCounter};

/// Shorter intervals (including zero) are raised to this
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Background task refreshing the unread counter on a fixed interval.
///
/// Safety net for push events that were missed or silently dropped; runs
/// whether or not the push channel is up.
pub struct UnreadPollTask {
    counter: Arc<UnreadCounter>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl UnreadPollTask {
    pub fn new(
        counter: Arc<UnreadCounter>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            counter,
            interval: interval.max(MIN_POLL_INTERVAL),
            shutdown,
        }
    }

    /// Run until the shutdown signal fires (or its sender is dropped)
    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Unread poll task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!("Unread poll task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    if let Err(e) = self.counter.refresh(RefreshTrigger::Poll).await {
                        tracing::debug!(error = %e, "Polled unread refresh failed");
                    }
                }
            }
        }

        tracing::info!("Unread poll task stopped");
    }
}

/// Owning handle of a spawned [`UnreadPollTask`]. Stops the task on drop.
pub struct UnreadPoller {
    handle: Option<JoinHandle<()>>,
    shutdown: broadcast::Sender<()>,
}

impl UnreadPoller {
    pub fn spawn_on(runtime: &Handle, counter: Arc<UnreadCounter>, interval: Duration) -> Self {
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = UnreadPollTask::new(counter, interval, shutdown_rx);
        let handle = runtime.spawn(task.run());

        Self {
            handle: Some(handle),
            shutdown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the timer. No refresh starts after this returns; one already in
    /// flight is cancelled.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.shutdown.send(());
            handle.abort();
        }
    }
}

impl Drop for UnreadPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
