//! Background tasks that run on a fixed interval until stopped.

use std::{future::Future, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Handle to a spawned periodic task.
///
/// Ticks never overlap: the next one starts only after the previous body
/// has completed. Dropping the handle leaves the task running; call
/// [`PeriodicTask::stop`] to end it.
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `tick` every `every`. The first run happens one interval after
    /// spawning.
    pub fn spawn<F, Fut>(name: &'static str, every: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            tracing::debug!(task = name, "periodic task stopped");
        });

        tracing::debug!(task = name, every_secs = every.as_secs(), "periodic task started");
        Self {
            name,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task and wait for an in-flight tick to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            tracing::warn!(task = self.name, error = %err, "periodic task ended abnormally");
        }
    }
}
