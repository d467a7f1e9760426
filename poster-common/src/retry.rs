//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure delivery retrying.
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A retry policy to determine how often and how far apart deliveries are retried.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past retry.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// How many retries may follow the first attempt.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the interval to wait before the given retry. Retries are numbered from 1, so the
    /// first retry waits `initial_interval` and every later one multiplies it by the coefficient.
    pub fn retry_interval(&self, retry: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(retry.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Whether another retry may be scheduled after `retries` retries have already run.
    pub fn can_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Total number of requests a single delivery may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    /// Coefficient to multiply initial_interval with for every past retry.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// How many retries may follow the first attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(2),
            maximum_interval: None,
            max_retries: 5,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> RetryPolicyBuilder {
        self.max_retries = max_retries;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_retries: self.max_retries,
        }
    }
}
