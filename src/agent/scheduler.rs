use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

/// Polling interval that can be changed while the poll loop sleeps
pub struct PollingScheduler {
    interval: watch::Sender<Duration>,
    min_interval: Duration,
}

impl PollingScheduler {
    /// Create a scheduler; `interval` is raised to `min_interval` if shorter
    pub fn new(interval: Duration, min_interval: Duration) -> Self {
        let (interval_tx, _) = watch::channel(interval.max(min_interval));
        Self {
            interval: interval_tx,
            min_interval,
        }
    }

    pub fn interval(&self) -> Duration {
        *self.interval.borrow()
    }

    /// Change the interval, clamped to the minimum; returns the effective value
    pub fn set_interval(&self, interval: Duration) -> Duration {
        let effective = interval.max(self.min_interval);
        let previous = self.interval.send_replace(effective);
        if previous != effective {
            tracing::info!(
                previous_secs = previous.as_secs(),
                interval_secs = effective.as_secs(),
                "Poll interval updated"
            );
        }
        effective
    }

    /// Sleep one interval, measured from the call, honoring changes made meanwhile
    pub async fn sleep_until_next_poll(&self) {
        let started = Instant::now();
        let mut interval_rx = self.interval.subscribe();

        loop {
            let interval = *interval_rx.borrow_and_update();
            tracing::debug!("Sleeping for {} seconds until next poll", interval.as_secs());

            tokio::select! {
                _ = sleep_until(started + interval) => return,
                Ok(()) = interval_rx.changed() => {}
            }
        }
    }

    /// Wall-clock time of the next poll if the loop went to sleep now
    pub fn next_poll_time(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.interval()).unwrap_or_else(|_| chrono::Duration::zero())
    }
}
