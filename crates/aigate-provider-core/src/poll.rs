//! Exponential-backoff polling for results that only become available after
//! asynchronous vendor processing.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// `None` or zero polls without a deadline.
    pub timeout: Option<Duration>,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            timeout: None,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl BackoffConfig {
    fn multiplier(&self) -> f64 {
        if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            DEFAULT_MULTIPLIER
        }
    }

    fn max_interval(&self) -> Duration {
        self.max_interval.max(self.initial_interval)
    }

    fn deadline(&self, start: Instant) -> Option<Instant> {
        self.timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| start + timeout)
    }

    /// The interval that follows `current`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let max = self.max_interval();
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier())
            .map_or(max, |next| next.min(max))
    }
}

#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(Result<T, E>),
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("polling timed out")]
    Timeout,
    #[error("polling cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(E),
}

/// Calls `attempt` until it reports `Done`, the deadline passes or `cancel`
/// fires. The first attempt runs immediately, and no attempt starts after
/// cancellation.
pub async fn poll<T, E, F, Fut>(
    cancel: &CancellationToken,
    config: &BackoffConfig,
    mut attempt: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let deadline = config.deadline(Instant::now());
    let mut interval = config.initial_interval;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        match attempt().await {
            Attempt::Done(result) => return result.map_err(PollError::Failed),
            Attempt::Pending => {}
        }

        let mut wait = interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::Timeout);
            }
            wait = wait.min(deadline - now);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(PollError::Timeout);
        }
        interval = config.next_interval(interval);
    }
}
