use crate::storage::Storage;
use crate::AmpError;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Blocks an idle worker until another process publishes on its channel
///
/// Publishing bumps a per-channel counter in the queue store; waiting polls
/// that counter. A wait always ends after the idle timeout so a worker
/// re-checks its queue even when a notification was lost.
#[derive(Debug, Clone)]
pub struct Waiter {
    channel: String,
    seen: i64,
    poll_interval: Duration,
    idle_timeout: Duration,
}

impl Waiter {
    /// Subscribes to a channel; only later notifications wake the waiter
    pub fn subscribe<S: Storage>(
        storage: &S,
        channel: String,
        poll_interval: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, AmpError> {
        let seen = storage.notification_seq(&channel)?;
        Ok(Self {
            channel,
            seen,
            poll_interval,
            idle_timeout,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for a notification
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The channel was notified
    /// * `Ok(false)` - The idle timeout passed first
    pub async fn wait<S: Storage>(&mut self, storage: &S) -> Result<bool, AmpError> {
        let deadline = Instant::now() + self.idle_timeout;
        loop {
            let seq = storage.notification_seq(&self.channel)?;
            if seq != self.seen {
                self.seen = seq;
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
