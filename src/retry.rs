use crate::config::PollSettings;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(250);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterMode {
    #[default]
    None,
    Equal,
    Full,
}

/// Bounded exponential backoff used for broker connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter: JitterMode,
}

impl Default for ConnectRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter: JitterMode::Equal,
        }
    }
}

impl ConnectRetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        let max_attempts = if max_attempts == 0 {
            DEFAULT_MAX_ATTEMPTS
        } else {
            max_attempts
        };
        Self {
            max_attempts,
            base_backoff,
            max_backoff: max_backoff.max(base_backoff),
            jitter: JitterMode::None,
        }
    }

    pub fn from_settings(settings: &PollSettings) -> Self {
        Self::new(
            settings.connect_attempts,
            settings.connect_base_backoff,
            settings.connect_max_backoff,
        )
        .with_jitter(JitterMode::Equal)
    }

    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the next attempt, or `None` once the attempt budget is spent.
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }

        let delay = self.compute_backoff(attempts);
        Some(match self.jitter {
            JitterMode::None => delay,
            JitterMode::Equal => jitter_between(delay.mul_f64(0.5), delay),
            JitterMode::Full => jitter_between(Duration::ZERO, delay),
        })
    }

    fn compute_backoff(&self, attempts: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempts.saturating_sub(1).min(8);
        let factor = 1u32 << exponent;
        self.base_backoff
            .mul_f64(f64::from(factor))
            .min(self.max_backoff)
    }

    /// Runs `attempt` until it succeeds or the budget is spent, returning the
    /// last error together with the number of attempts made.
    pub async fn run<F, Fut, T, E>(&self, mut attempt: F) -> Result<T, (E, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt(attempts).await {
                Ok(value) => return Ok(value),
                Err(err) => match self.next_delay(attempts) {
                    Some(delay) => {
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                    }
                    None => return Err((err, attempts)),
                },
            }
        }
    }
}

pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    let min_secs = min.as_secs_f64();
    let span = max.as_secs_f64() - min_secs;
    let sample = rng.gen::<f64>() * span + min_secs;
    Duration::from_secs_f64(sample)
}
