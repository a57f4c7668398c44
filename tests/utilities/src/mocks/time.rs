use async_trait::async_trait;
use eth_txm::time::Time;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Real time that records every sleep.
#[derive(Clone, Debug, Default)]
pub struct CountingTime {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl CountingTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sleeps of exactly `duration`.
    pub fn count(&self, duration: Duration) -> usize {
        self.sleeps().into_iter().filter(|d| *d == duration).count()
    }
}

#[async_trait]
impl Time for CountingTime {
    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
        tokio::time::sleep(duration).await;
    }

    fn elapsed(&self, start: Instant) -> Duration {
        start.elapsed()
    }
}
