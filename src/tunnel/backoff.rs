//! Exponential backoff with jitter for redialling long-lived channels.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

/// Shape of a backoff schedule.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// First delay before randomisation.
    pub initial_interval: Duration,
    /// Growth factor applied after every attempt.
    pub multiplier: f64,
    /// Each delay is drawn uniformly from `d * (1 ± randomization_factor)`.
    pub randomization_factor: f64,
    /// Cap on the un-randomised delay.
    pub max_interval: Duration,
    /// Give up once this much time has passed since the first attempt.
    /// `None` retries forever.
    pub max_elapsed_time: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Some(Duration::from_secs(15 * 60)),
        }
    }
}

impl BackoffPolicy {
    /// Schedule used for request and meta channel dials: gentle growth,
    /// little jitter, capped at ten seconds, unbounded.
    pub fn channel_dial() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.2,
            randomization_factor: 0.05,
            max_interval: Duration::from_secs(10),
            max_elapsed_time: None,
        }
    }

    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current: self.initial_interval,
            started: Instant::now(),
        }
    }
}

/// Running state of one backoff schedule.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    started: Instant,
}

impl Backoff {
    /// Delay before the next attempt, or `None` once the elapsed budget is
    /// spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_elapsed_time {
            if self.started.elapsed() > max {
                return None;
            }
        }
        let delay = randomize(self.current, self.policy.randomization_factor);
        let grown = self.current.as_secs_f64() * self.policy.multiplier;
        self.current = if grown >= self.policy.max_interval.as_secs_f64() {
            self.policy.max_interval
        } else {
            Duration::from_secs_f64(grown)
        };
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial_interval;
        self.started = Instant::now();
    }
}

fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let base = interval.as_secs_f64();
    let delta = base * factor;
    let jittered = rand::thread_rng().gen_range((base - delta)..=(base + delta));
    Duration::from_secs_f64(jittered.max(0.0))
}

/// Run `operation` until it succeeds or the policy gives up, sleeping
/// between attempts. Returns the last error when the budget runs out.
pub async fn retry<F, Fut, T, E>(
    policy: &BackoffPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = policy.start();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let Some(delay) = backoff.next_delay() else {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "giving up after backoff budget ran out"
                    );
                    return Err(e);
                };
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
