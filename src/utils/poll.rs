//! Fixed-interval polling
//!
//! Every suspension point of the pipeline (task completion, guest readiness,
//! shutdown confirmation) goes through [`Poller`].

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

use crate::error::{Error, Result};

/// Polling schedule
#[derive(Clone, Debug)]
pub struct Poller {
    interval: Duration,
    jitter: Duration,
    timeout: Option<Duration>,
}

impl Default for Poller {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            jitter: Duration::ZERO,
            timeout: None,
        }
    }
}

impl Poller {
    /// Poll at a fixed interval, forever
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    /// Add up to `jitter` of random delay to every sleep
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Give up with [`Error::Timeout`] once `timeout` has elapsed
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `check` until it returns `true`.
    ///
    /// Errors from the check propagate immediately; checks that want to
    /// treat a failure as "not yet" must map it to `Ok(false)` themselves.
    pub async fn wait_until<F, Fut>(&self, what: &str, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let start = Instant::now();
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            if check().await? {
                debug!("{} after {} check(s)", what, attempts);
                return Ok(());
            }

            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    return Err(Error::Timeout {
                        what: what.to_string(),
                        after: timeout,
                    });
                }
            }

            sleep(self.next_delay()).await;
        }
    }

    fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let extra = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
        self.interval + Duration::from_millis(extra)
    }
}
