use std::time::Duration;

/// Retries with an exponentially increasing delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialRetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u16,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u8,
}

pub struct RetryState {
    policy: ExponentialRetryPolicy,
    n_retries: u16,
    delay: Duration,
}

impl RetryState {
    pub fn new(policy: &ExponentialRetryPolicy) -> Self {
        Self {
            policy: policy.clone(),
            n_retries: 0,
            delay: policy.initial_delay,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.n_retries < self.policy.max_retries
    }

    /// Number of retries done so far.
    pub fn retries(&self) -> u16 {
        self.n_retries
    }

    /// The delay to wait before the next retry.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Starts over with the initial delay, after a successful attempt.
    pub fn reset(&mut self) {
        self.n_retries = 0;
        self.delay = self.policy.initial_delay;
    }

    fn count_and_increase_delay(&mut self) {
        self.n_retries += 1;
        self.delay = (self.delay * self.policy.multiplier.into()).min(self.policy.max_delay);
    }

    pub async fn after_attempt(&mut self) {
        tokio::time::sleep(self.delay).await;
        self.count_and_increase_delay();
    }
}
