// Request pacing: wait until the backend reports budget for another request.
use std::future::Future;
use std::time::Duration;

use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Throttle {
    poll_interval: Duration,
}

impl Throttle {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Polls `budget` until it is non-zero. Returns how many polls came back empty.
    pub async fn wait<F, Fut>(&self, mut budget: F) -> u32
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = u32>,
    {
        let mut empty = 0;
        while budget().await == 0 {
            if empty == 0 {
                debug!("request budget exhausted; waiting");
            }
            empty += 1;
            tokio::time::sleep(self.poll_interval).await;
        }
        empty
    }
}
